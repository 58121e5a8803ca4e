//! HTTP fetch with a bounded number of attempts.
//!
//! Every upstream call (simple pages, JSON metadata, artifact downloads)
//! goes through [`fetch_with_retry`] or [`fetch_bytes_with_retry`]. Retries
//! are immediate by default: `backoff` is zero unless a caller sets it.
//! Connect and read timeouts live on the [`Client`] and therefore apply to
//! each attempt separately.

use crate::error::OffgridError;
use bytes::Bytes;
use reqwest::{Client, Response};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of fetch attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts. Zero means retry immediately.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `attempt` up to `config.max_attempts` times, returning the first success.
///
/// # Errors
///
/// Returns [`OffgridError::UpstreamUnavailable`] carrying the last
/// [`reqwest::Error`] once all attempts are exhausted.
async fn retry<T, F, Fut>(
    url: &str,
    config: &RetryConfig,
    mut attempt: F,
) -> Result<T, OffgridError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, reqwest::Error>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt_no = 1;

    loop {
        match attempt().await {
            Ok(value) => {
                if attempt_no > 1 {
                    debug!("HTTP fetch for {} recovered on attempt {}", url, attempt_no);
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(
                    "HTTP fetch failed for {} (attempt {}/{}): {}",
                    url, attempt_no, max_attempts, e
                );

                if attempt_no >= max_attempts {
                    return Err(OffgridError::UpstreamUnavailable {
                        url: url.to_string(),
                        attempts: max_attempts,
                        source: e,
                    });
                }
            }
        }

        attempt_no += 1;
        if !config.backoff.is_zero() {
            tokio::time::sleep(config.backoff).await;
        }
    }
}

/// Fetch a URL via HTTP GET and return the first successful (2xx) response.
///
/// The body is left unread so callers can stream it; failures while reading
/// it are not retried here.
pub async fn fetch_with_retry(
    client: &Client,
    url: &str,
    config: &RetryConfig,
) -> Result<Response, OffgridError> {
    retry(url, config, || async move {
        client.get(url).send().await?.error_for_status()
    })
    .await
}

/// Fetch a URL and read the full body, retrying on connect, status or body errors.
pub async fn fetch_bytes_with_retry(
    client: &Client,
    url: &str,
    config: &RetryConfig,
) -> Result<Bytes, OffgridError> {
    retry(url, config, || async move {
        client.get(url).send().await?.error_for_status()?.bytes().await
    })
    .await
}
