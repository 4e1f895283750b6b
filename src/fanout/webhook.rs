use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::fanout::signature;
use crate::fanout::{FanoutEvent, Notifier};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers events to an external webhook endpoint. One POST per event,
/// no retries: a failed delivery is logged by the fan-out worker and the
/// event is gone.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url,
            secret,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &FanoutEvent) -> Result<()> {
        let body = serde_json::to_vec(event)?;

        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("x-hoplink-event", event.kind.as_str());

        if let Some(secret) = &self.secret {
            let sig = signature::sign(secret.as_bytes(), &body)?;
            request = request.header("x-hoplink-signature", sig);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("webhook returned {}", response.status()));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
