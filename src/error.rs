use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("element not found: {0}")]
    SelectorMiss(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("fetch incomplete: {0}")]
    Incomplete(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Network(_) => "NETWORK",
            Self::Decode(_) => "DECODE",
            Self::SelectorMiss(_) => "SELECTOR_MISS",
            Self::Api(_) => "API",
            Self::Incomplete(_) => "INCOMPLETE",
            Self::Database(_) => "DATABASE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Decode(value.to_string());
        }
        Self::Network(value.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(value: url::ParseError) -> Self {
        Self::InvalidArgument(format!("url: {value}"))
    }
}
