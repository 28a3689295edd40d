//! Crawling substrate contract and its plain-HTTP adapter.
//!
//! The pipeline hands the substrate a list of URLs and a shared header
//! set and gets back the bodies that could be fetched. Each URL is
//! fetched independently: transient failures are retried with backoff
//! up to a bound, and a URL that exhausts its retries is logged and
//! excluded from the results without aborting the rest of the batch.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Shared request headers for one batch. A session cookie is the
/// minimum most sites require.
#[derive(Debug, Clone, Default)]
pub struct FetchHeaders {
    pub cookie: String,
}

/// One successfully fetched page. Results are keyed by originating
/// URL; arrival order carries no meaning.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
}

/// Batch fetch contract required by the resolvers (raw mode).
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch every URL independently. Failed URLs are reported via
    /// logs and omitted from the returned set.
    async fn fetch_batch(
        &self,
        urls: &[String],
        headers: &FetchHeaders,
        max_retries: u32,
    ) -> Vec<FetchedPage>;

    /// Release any per-batch storage the substrate accumulated.
    async fn reclaim(&self) {}
}

/// Reqwest-backed substrate adapter.
///
/// Adds polite spacing between request starts so concurrent batches do
/// not hammer a host, and retries transient failures with exponential
/// backoff. HTTP 429 doubles the backoff.
pub struct HttpFetcher {
    client: Client,
    retry_delay: Duration,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, min_interval: Duration, retry_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stream-resolver/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            retry_delay,
            min_interval,
            last_request: Mutex::new(None),
        })
    }

    /// Wait until this request may start, honoring the minimum spacing.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last {
            let elapsed = now.duration_since(previous);
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Fetch one URL with retry and backoff.
    async fn fetch_one(
        &self,
        url: &str,
        headers: &FetchHeaders,
        max_retries: u32,
    ) -> Result<String> {
        for attempt in 0..=max_retries {
            self.pace().await;

            debug!(url = url, attempt = attempt + 1, "Fetching");

            let mut request = self.client.get(url);
            if !headers.cookie.is_empty() {
                request = request.header(reqwest::header::COOKIE, headers.cookie.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .with_context(|| format!("Failed to read response body: {}", url));
                    }

                    let backoff = if status == StatusCode::TOO_MANY_REQUESTS {
                        self.retry_delay * 2u32.pow(attempt) * 2
                    } else {
                        self.retry_delay * 2u32.pow(attempt)
                    };

                    warn!(url = url, status = %status, "Fetch returned error status");

                    if attempt < max_retries {
                        debug!(delay_ms = backoff.as_millis() as u64, "Retrying after delay");
                        sleep(backoff).await;
                        continue;
                    }
                    return Err(anyhow!("Fetch failed with status {}: {}", status, url));
                }
                Err(e) => {
                    warn!(url = url, error = %e, "Fetch error");

                    if attempt < max_retries {
                        let backoff = self.retry_delay * 2u32.pow(attempt);
                        sleep(backoff).await;
                        continue;
                    }
                    return Err(anyhow!("Fetch failed after {} retries: {}", max_retries, e));
                }
            }
        }

        Err(anyhow!("Fetch failed after all retries: {}", url))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_batch(
        &self,
        urls: &[String],
        headers: &FetchHeaders,
        max_retries: u32,
    ) -> Vec<FetchedPage> {
        let fetches = urls.iter().map(|url| async move {
            match self.fetch_one(url, headers, max_retries).await {
                Ok(body) => Some(FetchedPage {
                    url: url.clone(),
                    body,
                }),
                Err(e) => {
                    warn!(url = %url, error = %e, "Request dropped after exhausting retries");
                    None
                }
            }
        });

        futures::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_fetcher_creation() {
        let fetcher = HttpFetcher::new(
            Duration::from_secs(30),
            Duration::from_millis(250),
            Duration::from_millis(1000),
        );
        assert!(fetcher.is_ok());
    }

    #[tokio::test]
    async fn test_pacing_spaces_request_starts() {
        let fetcher = HttpFetcher::new(
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .unwrap();

        let start = Instant::now();
        fetcher.pace().await;
        fetcher.pace().await;
        fetcher.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
