use crate::config::ScraperConfig;
use crate::error::WatchError;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

pub struct HttpClient {
    inner: reqwest::Client,
    config: ScraperConfig,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// Fetch a URL as text with a polite delay and bounded retries on transient failures.
    pub async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, WatchError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.request_delay_ms.max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.config.max_retries as usize);

        let mut attempt = 0u32;
        RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                self.attempt(url, timeout, attempt)
            },
            |e: &WatchError| {
                let retry = e.is_transient();
                if retry {
                    warn!("GET {} failed, will retry: {}", url, e);
                }
                retry
            },
        )
        .await
    }

    async fn attempt(
        &self,
        url: &str,
        timeout: Duration,
        attempt: u32,
    ) -> Result<String, WatchError> {
        self.polite_delay().await;
        debug!("GET {} (attempt {})", url, attempt);

        let resp = self
            .inner
            .get(url)
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.config.accept_language)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        resp.text().await.map_err(|e| classify_reqwest(url, e))
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter_ms = match self.config.jitter_ms {
            0 => 0,
            max => rand::random::<u64>() % (max + 1),
        };
        let total = Duration::from_millis(self.config.request_delay_ms + jitter_ms);
        if !total.is_zero() {
            sleep(total).await;
        }
    }
}

/// 408, 429 and 5xx are worth retrying; any other non-success status is not.
pub fn classify_status(url: &str, status: StatusCode) -> WatchError {
    let message = format!("HTTP {}", status);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        WatchError::transient_fetch(url, message)
    } else {
        WatchError::permanent_fetch(url, message)
    }
}

fn classify_reqwest(url: &str, e: reqwest::Error) -> WatchError {
    if e.is_builder() {
        WatchError::permanent_fetch(url, e.to_string())
    } else {
        WatchError::transient_fetch(url, e.to_string())
    }
}
