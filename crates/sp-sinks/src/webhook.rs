// SPDX-License-Identifier: Apache-2.0

//! Webhook sink: an HTTP POST (or configured method) per `Write`, retried
//! with a fixed delay up to `max_retries` times. Any 2xx response is a
//! success; anything else, including a transport error, counts against the
//! retry budget.

use async_trait::async_trait;
use bytes::Bytes;
use fnmesh_config::WebhookSinkAttributes;
use fnmesh_sink::{Sink, SinkCore, SinkError, SinkFactory, SinkRegistry, WriteMetadata};
use std::sync::Arc;
use tokio::time::Duration;

pub const KIND: &str = "webhook";

pub struct WebhookSink {
    core: SinkCore,
    attrs: WebhookSinkAttributes,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(core: SinkCore, attrs: WebhookSinkAttributes) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(attrs.timeout_s))
            .build()
            .unwrap_or_default();
        WebhookSink { core, attrs, client }
    }

    async fn attempt(&self, data: &Bytes) -> Result<(), SinkError> {
        let method = reqwest::Method::from_bytes(self.attrs.method.as_bytes())
            .map_err(|e| SinkError::Config(format!("invalid method {}: {e}", self.attrs.method)))?;
        let mut request = self.client.request(method, &self.attrs.url).body(data.clone());
        for (key, value) in &self.attrs.headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Remote(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Remote(format!(
                "webhook returned status {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn start(&self) -> Result<(), SinkError> {
        self.core.enter_started();
        Ok(())
    }

    async fn stop(&self, _force: bool) -> Result<(), SinkError> {
        self.core.enter_draining();
        self.core.enter_stopped();
        Ok(())
    }

    async fn write(&self, data: Bytes, _metadata: WriteMetadata) -> Result<(), SinkError> {
        self.core.guard_write()?;
        let mut attempts = 0u32;
        loop {
            match self.attempt(&data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts < self.attrs.max_retries => {
                    attempts += 1;
                    tracing::warn!(
                        attempt = attempts,
                        max = self.attrs.max_retries,
                        error = %e,
                        "webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(self.attrs.retry_delay_s)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn get_config(&self) -> serde_json::Value {
        self.core.config()
    }
}

pub fn register(registry: &mut SinkRegistry) {
    registry.register(KIND, |config: serde_json::Value| {
        let attrs =
            WebhookSinkAttributes::parse(&config).map_err(|e| SinkError::Config(e.to_string()))?;
        let core = SinkCore::new(KIND, config);
        Ok(Arc::new(WebhookSink::new(core, attrs)) as Arc<dyn Sink>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_defaults_match_config_defaults() {
        let attrs = WebhookSinkAttributes::parse(&serde_json::json!({"url": "http://x"})).unwrap();
        assert_eq!(attrs.max_retries, 3);
        assert_eq!(attrs.retry_delay_s, 1);
    }
}
