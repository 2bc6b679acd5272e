//! Outbound alerting (Slack webhook).
//!
//! Alerts are fire-and-forget: a failed delivery is logged and never affects
//! the trading path.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AlertsConfig;

/// What kind of event an alert describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BreakerTripped,
    GlobalBreakerTripped,
    PositionAbandoned,
    DailyLossHalt,
}

/// Sink for operator alerts. Implementations must never block the caller on
/// delivery.
pub trait AlertSink: Send + Sync {
    fn alert(&self, kind: AlertKind, title: &str, body: &str);
}

/// Slack incoming-webhook sink.
pub struct SlackSink {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl SlackSink {
    pub fn new(config: &AlertsConfig) -> Self {
        Self {
            webhook_url: config.slack_webhook_url.clone(),
            http: reqwest::Client::new(),
        }
    }
}

impl AlertSink for SlackSink {
    fn alert(&self, kind: AlertKind, title: &str, body: &str) {
        let url = match &self.webhook_url {
            Some(url) => url.clone(),
            None => {
                debug!(?kind, title, "Alert sink not configured, dropping alert");
                return;
            }
        };

        let payload = serde_json::json!({
            "text": format!("[{:?}] {}\n{}", kind, title, body),
        });
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = http.post(&url).json(&payload).send().await {
                warn!(error = %e, "Failed to deliver alert");
            }
        });
    }
}

/// Discards all alerts. Default for tests and paper runs.
#[derive(Default)]
pub struct NullSink;

impl AlertSink for NullSink {
    fn alert(&self, kind: AlertKind, title: &str, _body: &str) {
        debug!(?kind, title, "Alert (null sink)");
    }
}
