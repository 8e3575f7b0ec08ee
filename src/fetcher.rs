use std::{sync::Arc, time::Duration};

use anyhow::bail;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::PortalError, store::UserId, transport::Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// The n-th failure waits `n * base_delay_ms` before the next attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 3000,
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * u64::from(attempt))
    }
}

/// GET with linear backoff.
#[derive(Clone)]
pub struct Fetcher {
    user_id: UserId,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(user_id: UserId, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            user_id,
            transport,
            policy,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn fetch(&self, url: &Url) -> Result<String, PortalError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            debug!("{}: Fetching {url} (attempt {attempt})", self.user_id);
            match self.try_fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!("{}: Failed to fetch {url}: {e:#}", self.user_id);
                    last_error = format!("{e:#}");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }
        Err(PortalError::TransientNetwork {
            url: url.clone(),
            attempts,
            last_error,
        })
    }

    async fn try_fetch(&self, url: &Url) -> anyhow::Result<String> {
        let response = self.transport.get(url).await?;
        if !response.status.is_success() {
            bail!("Server responded with {}", response.status);
        }
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use reqwest::StatusCode;
    use url::Url;

    use super::{Fetcher, RetryPolicy};
    use crate::{error::PortalError, store::UserId, testing::FakeTransport};

    fn url() -> Url {
        Url::parse("https://portal.test/dashboard").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_all_attempts() {
        let transport = Arc::new(FakeTransport::new());
        let fetcher = Fetcher::new(UserId(1), transport.clone(), RetryPolicy::default());
        let started = tokio::time::Instant::now();
        let error = fetcher.fetch(&url()).await.unwrap_err();
        match error {
            PortalError::TransientNetwork {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 10);
                assert!(last_error.contains("No route"), "{last_error}");
            }
            e => panic!("unexpected error: {e:?}"),
        }
        assert_eq!(transport.get_count(&url()), 10);
        // 3s * (1 + 2 + ... + 9)
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(135) && elapsed < Duration::from_secs(136));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_failures() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_status(&url(), StatusCode::BAD_GATEWAY, "");
        transport.respond_status(&url(), StatusCode::BAD_GATEWAY, "");
        transport.respond(&url(), "hello");
        let fetcher = Fetcher::new(UserId(1), transport.clone(), RetryPolicy::default());
        let started = tokio::time::Instant::now();
        assert_eq!(fetcher.fetch(&url()).await.unwrap(), "hello");
        assert_eq!(transport.get_count(&url()), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
    }
}
