use std::time::Duration;

use async_trait::async_trait;

/// Executes one health probe against a service endpoint. A timeout counts
/// as a failed probe, never as an indeterminate hang.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// HTTP GET probe: healthy iff the endpoint answers 2xx within the timeout.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    tracing::debug!(url, status = %response.status(), "health probe unhealthy");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(url, "health probe failed: {e}");
                false
            }
        }
    }
}
