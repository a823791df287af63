//! HTTP client for the exchange's historical candle endpoint.

use std::time::Duration;

use candela_types::Timeframe;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::parse::{parse_history_response, ParseError};

/// The exchange caps history pages at 100 rows.
pub const PAGE_LIMIT: u32 = 100;

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the exchange REST API.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds).
    pub max_delay_ms: u64,
    /// Minimum spacing between consecutive requests.
    pub min_request_interval: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.okx.com".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            // The public endpoint allows 20 requests per 2 seconds; pace
            // well under that so reconciliation never trips the limiter.
            min_request_interval: Duration::from_millis(200),
            user_agent: format!("candela/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Errors that can occur while fetching historical candles.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchange returned a business-level error code.
    #[error("API error {code}: {message}")]
    Api {
        /// Exchange error code (`"0"` means success).
        code: String,
        /// Human-readable message from the exchange.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("Malformed response: {0}")]
    Parse(#[from] ParseError),

    /// Rate limited past the retry ceiling.
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Server kept failing past the retry ceiling.
    #[error("Server error {status} after {attempts} attempts")]
    ServerError {
        /// Last HTTP status code seen.
        status: u16,
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Pooled, paced HTTP client with bounded retries.
///
/// One instance is shared by every reconciliation task; the pacing lock
/// serializes request starts so the global rate limit holds regardless of
/// how many gaps are being filled concurrently.
#[derive(Debug)]
pub struct RestClient {
    client: Client,
    config: RestConfig,
    last_request: Mutex<Option<Instant>>,
}

impl RestClient {
    /// Creates a new REST client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: RestConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            config,
            last_request: Mutex::new(None),
        })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        Self::new(RestConfig::default())
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Fetches one page of closed candles strictly older than `after_ms`,
    /// newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails after all retries or the
    /// response cannot be decoded.
    pub async fn history_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        after_ms: i64,
        limit: u32,
    ) -> Result<Vec<candela_types::Candle>, FetchError> {
        let url = format!(
            "{}/api/v5/market/history-candles?instId={}&bar={}&after={}&limit={}",
            self.config.base_url,
            symbol,
            timeframe.bar(),
            after_ms,
            limit.min(PAGE_LIMIT),
        );

        let mut attempts = 0;
        loop {
            self.throttle().await;
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        if attempts >= self.config.max_retries {
                            return Err(FetchError::RateLimited { attempts });
                        }
                        attempts += 1;
                        let delay = retry_after(&response)
                            .unwrap_or_else(|| self.backoff_delay(attempts));
                        warn!(%symbol, ?delay, attempt = attempts, "rate limited, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if status.is_server_error() {
                        if attempts >= self.config.max_retries {
                            return Err(FetchError::ServerError {
                                status: status.as_u16(),
                                attempts,
                            });
                        }
                        attempts += 1;
                        tokio::time::sleep(self.backoff_delay(attempts)).await;
                        continue;
                    }
                    response.error_for_status_ref()?;
                    let body = response.text().await?;
                    let candles = parse_history_response(symbol, timeframe, &body)?;
                    debug!(%symbol, %timeframe, rows = candles.len(), "fetched history page");
                    return Ok(candles);
                }
                Err(e) if is_retryable(&e) && attempts < self.config.max_retries => {
                    attempts += 1;
                    tokio::time::sleep(self.backoff_delay(attempts)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sleeps until the minimum inter-request interval has elapsed.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_request_interval {
                tokio::time::sleep(self.config.min_request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Exponential backoff with deterministic jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.config.max_delay_ms);

        // Deterministic jitter (±25%) avoids a random number generator.
        let jitter_range = capped / 4;
        let jitter = if jitter_range > 0 {
            (u64::from(attempt) * 17) % (jitter_range * 2)
        } else {
            0
        };
        let delay = (capped + jitter).saturating_sub(jitter_range).max(100);
        Duration::from_millis(delay)
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_retryable(error: &reqwest::Error) -> bool {
    if error.is_builder() {
        return false;
    }
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_config_default() {
        let config = RestConfig::default();
        assert_eq!(config.base_url, "https://www.okx.com");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.min_request_interval, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_client_creation() {
        assert!(RestClient::with_defaults().is_ok());
    }

    #[test]
    fn test_backoff_delay_monotone_until_cap() {
        let client = RestClient::with_defaults().unwrap();

        let d1 = client.backoff_delay(1);
        assert!(d1.as_millis() >= 750 && d1.as_millis() <= 1250);

        let d2 = client.backoff_delay(2);
        assert!(d2.as_millis() >= 1500 && d2.as_millis() <= 2500);

        // High attempts stay at the cap (plus jitter).
        let high = client.backoff_delay(20);
        assert!(high.as_millis() <= 37_500);
    }
}
