use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::error::AppError;

const USER_AGENT: &str = concat!("trophy-cli/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can turn a URL into a UTF-8 body.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, url: &Url) -> Result<String, AppError>;
}

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch_text(&self, url: &Url) -> Result<String, AppError> {
        let bytes = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        decode_body(url, &bytes)
    }
}

/// Bodies must be valid UTF-8; nothing is replaced lossily.
fn decode_body(url: &Url, bytes: &[u8]) -> Result<String, AppError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| AppError::Decode(format!("{url}: body is not utf-8: {e}")))
}

/// Shares one semaphore across every request of a pipeline run.
#[derive(Clone)]
pub struct Throttled {
    inner: Arc<dyn PageSource>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Throttled {
    pub fn new(inner: Arc<dyn PageSource>, max_in_flight: usize) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn fetch_text(&self, url: &Url) -> Result<String, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("request permits closed: {e}")))?;
        debug!(%url, "GET");
        self.inner.fetch_text(url).await
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    enum Reply {
        Body(String),
        Fail,
        Hang,
    }

    /// In-memory page source keyed by full URL. Unknown URLs fail as transport errors.
    #[derive(Default)]
    pub struct FakeSource {
        replies: Mutex<HashMap<String, Reply>>,
        pub requests: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(self, url: &str, body: &str) -> Self {
            self.insert(url, Reply::Body(body.to_string()))
        }

        pub fn fail(self, url: &str) -> Self {
            self.insert(url, Reply::Fail)
        }

        pub fn hang(self, url: &str) -> Self {
            self.insert(url, Reply::Hang)
        }

        fn insert(self, url: &str, reply: Reply) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_string(), reply);
            self
        }

        pub fn request_count(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.as_str() == url)
                .count()
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn fetch_text(&self, url: &Url) -> Result<String, AppError> {
            self.requests.lock().unwrap().push(url.to_string());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let body = match self.replies.lock().unwrap().get(url.as_str()) {
                Some(Reply::Body(body)) => Some(body.clone()),
                Some(Reply::Hang) => None,
                Some(Reply::Fail) | None => {
                    return Err(AppError::Network(format!("no route to {url}")));
                }
            };
            match body {
                Some(body) => Ok(body),
                None => std::future::pending().await,
            }
        }
    }
}
