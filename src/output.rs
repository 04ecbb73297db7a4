use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::AppError;
use crate::models::{DataSource, Envelope, ErrorBody, Meta};

const ENVELOPE_VERSION: &str = "1.0.0";

pub fn print_success<T: Serialize>(
    format: OutputFormat,
    data: T,
    source: DataSource,
    human: impl FnOnce(&T),
) {
    match format {
        OutputFormat::Human => human(&data),
        OutputFormat::Json => println!("{}", render(&envelope(Some(data), source, None))),
    }
}

pub fn print_error(format: OutputFormat, error: AppError) {
    match format {
        OutputFormat::Human => {
            eprintln!("Error [{}]: {}", error.code(), error);
        }
        OutputFormat::Json => {
            let body = ErrorBody {
                code: error.code(),
                message: error.to_string(),
            };
            let envelope = envelope::<serde_json::Value>(None, DataSource::Internal, Some(body));
            eprintln!("{}", render(&envelope));
        }
    }
}

fn envelope<T: Serialize>(
    data: Option<T>,
    source: DataSource,
    error: Option<ErrorBody>,
) -> Envelope<T> {
    Envelope {
        ok: error.is_none(),
        data,
        meta: Meta {
            version: ENVELOPE_VERSION,
            source,
        },
        error,
    }
}

fn render<T: Serialize>(envelope: &Envelope<T>) -> String {
    serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".to_string())
}
