//! Best-effort alerting
//!
//! A [`Notifier`] never fails the pipeline: delivery errors are logged and
//! swallowed.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        warn!(alert = true, "{}", message);
    }
}

/// Posts `{"text": message}` to a Slack-style incoming webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(concat!("tabload/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| tabload_common::TabloadError::config(format!("webhook client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        warn!(alert = true, "{}", message);

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => debug!("Alert delivered"),
            Ok(r) => warn!(status = %r.status(), "Alert webhook rejected message"),
            Err(e) => warn!(error = %e, "Alert webhook unreachable"),
        }
    }
}

/// Webhook when a URL is configured, log-only otherwise
pub fn from_url(url: Option<&str>) -> Result<Arc<dyn Notifier>> {
    match url.filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url)?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
