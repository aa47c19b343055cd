//! Shared indexer HTTP client with request spacing, optional retries and offline mode.

use crate::chain::normalize::NormalizeError;
use crate::config::HttpConfig;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: status {0} body {1}")]
    Api(u16, String),
    #[error("upstream does not support this request")]
    Unsupported,
    #[error("offline mode: no cached history for this position")]
    Offline,
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("url: {0}")]
    Url(#[from] url::ParseError),
    #[error("pointer: {0}")]
    Pointer(#[from] crate::pointer::PointerError),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Worth another attempt within the same request (rate limits, 5xx, transport).
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(_) => true,
            FetchError::Api(status, _) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub struct HttpClient {
    config: HttpConfig,
    client: Option<reqwest::Client>,
    last_request: Mutex<Option<OffsetDateTime>>,
    request_count: AtomicU64,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> Result<Self, FetchError> {
        let client = if config.offline {
            None
        } else {
            Some(
                reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()?,
            )
        };
        Ok(Self {
            config,
            client,
            last_request: Mutex::new(None),
            request_count: AtomicU64::new(0),
        })
    }

    async fn rate_limit(&self) {
        let sleep_ms = {
            let prev = match self.last_request.lock() {
                Ok(last) => *last,
                Err(poisoned) => *poisoned.into_inner(),
            };
            match prev {
                Some(prev) => {
                    let elapsed = (OffsetDateTime::now_utc() - prev).whole_milliseconds();
                    let need = self.config.rate_limit_ms as i128;
                    (need - elapsed).max(0) as u64
                }
                None => 0,
            }
        };
        if sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        match self.last_request.lock() {
            Ok(mut last) => *last = Some(OffsetDateTime::now_utc()),
            Err(poisoned) => *poisoned.into_inner() = Some(OffsetDateTime::now_utc()),
        }
    }

    /// GET `url` and decode the JSON body. HTTP 501 maps to [`FetchError::Unsupported`].
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let client = self.client.as_ref().ok_or(FetchError::Offline)?;
        let mut attempt = 0;
        loop {
            self.rate_limit().await;
            match self.send(client, &url, bearer).await {
                Ok(body) => {
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(serde_json::from_str(&body)?);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let ms = backoff_ms(self.config.retry_backoff_ms, attempt);
                    warn!(attempt, ms, error = %e, "retry after error");
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        url: &Url,
        bearer: Option<&str>,
    ) -> Result<String, FetchError> {
        debug!(url = %url, "GET");
        let mut req = client.get(url.clone());
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status.as_u16() == 501 {
            return Err(FetchError::Unsupported);
        }
        if !status.is_success() {
            return Err(FetchError::Api(status.as_u16(), body));
        }
        Ok(body)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Exponential backoff for retry `attempt` (0-based), saturating at `u64::MAX`.
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    match 1u64.checked_shl(attempt) {
        Some(factor) => base_ms.saturating_mul(factor),
        None if base_ms == 0 => 0,
        None => u64::MAX,
    }
}

/// Join `base` with `path` segments, percent-encoding each segment.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, FetchError> {
    let mut path = base.path().trim_end_matches('/').to_string();
    for segment in segments {
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    let mut url = base.clone();
    url.set_path(&path);
    Ok(url)
}
