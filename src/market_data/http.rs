//! Shared HTTP plumbing for price sources.
//!
//! Every provider gets one [`RetryingClient`]: it paces calls to keep a minimum
//! gap between requests, bounds each request with a timeout, and retries HTTP
//! 429 responses with exponential backoff. All other failures are returned
//! immediately so the resolver can move on to the next source.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::SourceError;

/// Retry and pacing policy for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts for a rate-limited request, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Minimum gap between consecutive requests to the same provider.
    ///
    /// Concurrent calls through one client wait their turn: each request
    /// starts at least `min_interval` after the previous one, so `n`
    /// per-symbol lookups against a source without a batch endpoint take at
    /// least `(n - 1) * min_interval`. Zero disables the pacing.
    pub min_interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            min_interval: Duration::from_millis(250),
            timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * 2^attempt`, where `attempt` counts from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Authentication header attached to every request.
struct AuthHeader {
    name: String,
    value: SecretString,
}

pub struct RetryingClient {
    provider: String,
    client: Client,
    base_url: String,
    policy: BackoffPolicy,
    auth: Option<AuthHeader>,
    last_call: Mutex<Option<Instant>>,
}

impl RetryingClient {
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            client: Client::new(),
            base_url: trim_base_url(base_url.into()),
            policy: BackoffPolicy::default(),
            auth: None,
            last_call: Mutex::new(None),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base_url(base_url.into());
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_auth_header(mut self, name: impl Into<String>, value: SecretString) -> Self {
        self.auth = Some(AuthHeader {
            name: name.into(),
            value,
        });
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// GET `{base_url}{path}` with `query` and decode the JSON body as `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 0..max_attempts {
            self.pace().await;

            let mut request = self
                .client
                .get(&url)
                .query(query)
                .timeout(self.policy.timeout)
                .header("Accept", "application/json")
                .header("User-Agent", concat!("walletwatch/", env!("CARGO_PKG_VERSION")));
            if let Some(auth) = &self.auth {
                request = request.header(auth.name.as_str(), auth.value.expose_secret());
            }

            debug!(provider = %self.provider, url = %url, attempt, "sending price request");
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt + 1 >= max_attempts {
                    warn!(
                        provider = %self.provider,
                        attempts = max_attempts,
                        "rate limited; giving up"
                    );
                    return Err(SourceError::RateLimited {
                        attempts: max_attempts,
                    });
                }
                let delay = self.policy.delay_for(attempt);
                warn!(
                    provider = %self.provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited; backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    body: truncate(&body, 200),
                });
            }

            let bytes = response.bytes().await?;
            return serde_json::from_slice(&bytes).map_err(|e| {
                SourceError::Malformed(format!("{} response: {e}", self.provider))
            });
        }

        Err(SourceError::RateLimited {
            attempts: max_attempts,
        })
    }

    /// Waits until `min_interval` has passed since the previous call, then
    /// records this call. The lock is held across the sleep, so concurrent
    /// callers go out one at a time, `min_interval` apart.
    async fn pace(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.policy.min_interval {
                tokio::time::sleep(self.policy.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}
