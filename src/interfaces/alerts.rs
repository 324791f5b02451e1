use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use crate::core::config::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fire-and-forget alert sink. Delivery failures are logged, never returned.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, title: &str, message: &str);
}

/// Writes alerts into the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, title: &str, message: &str) {
        match severity {
            Severity::Info => info!(alert = title, "{}", message),
            Severity::Warning => warn!(alert = title, "{}", message),
            Severity::Critical => error!(alert = title, "{}", message),
        }
    }
}

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, severity: Severity, title: &str, message: &str) {
        let text = format!("{} [{}] {}\n\n{}", severity.icon(), severity, title, message);
        if let Err(e) = self.bot.send_message(self.chat_id, text).await {
            warn!("Failed to deliver telegram alert '{}': {}", title, e);
        }
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, title: &str, message: &str) {
        let body = json!({
            "severity": severity.label(),
            "title": title,
            "message": message,
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(res) if res.status().is_success() => {}
            Ok(res) => warn!("Alert webhook returned {} for '{}'", res.status(), title),
            Err(e) => warn!("Failed to deliver webhook alert '{}': {}", title, e),
        }
    }
}

/// Fans one alert out to every configured sink concurrently.
#[derive(Default)]
pub struct AlertHub {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl AlertHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// The log sink is always present; Telegram and webhook sinks are added
    /// when configured.
    pub fn from_config(config: &AlertConfig, timeout: Duration) -> Self {
        let mut hub = Self::new().with_sink(Arc::new(LogNotifier));
        if let (Some(token), Some(chat_id)) = (&config.telegram_bot_token, config.telegram_chat_id) {
            info!("Telegram alerts enabled for chat {}", chat_id);
            hub = hub.with_sink(Arc::new(TelegramNotifier::new(token, chat_id)));
        }
        if let Some(url) = &config.webhook_url {
            info!("Webhook alerts enabled");
            hub = hub.with_sink(Arc::new(WebhookNotifier::new(url.clone(), timeout)));
        }
        hub
    }
}

#[async_trait]
impl Notifier for AlertHub {
    async fn notify(&self, severity: Severity, title: &str, message: &str) {
        join_all(
            self.sinks
                .iter()
                .map(|sink| sink.notify(severity, title, message)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingNotifier;

    #[tokio::test]
    async fn hub_fans_out_to_every_sink() {
        let a = Arc::new(RecordingNotifier::default());
        let b = Arc::new(RecordingNotifier::default());
        let hub = AlertHub::new().with_sink(a.clone()).with_sink(b.clone());

        hub.notify(Severity::Critical, "Dead letter", "block 7").await;

        for sink in [&a, &b] {
            let alerts = sink.alerts();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].severity, Severity::Critical);
            assert_eq!(alerts[0].title, "Dead letter");
        }
    }

    #[test]
    fn config_without_channels_only_logs() {
        let hub = AlertHub::from_config(&AlertConfig::default(), Duration::from_secs(5));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn config_with_webhook_adds_a_sink() {
        let config = AlertConfig {
            webhook_url: Some("http://127.0.0.1:9/alerts".to_string()),
            ..Default::default()
        };
        assert_eq!(AlertHub::from_config(&config, Duration::from_secs(5)).len(), 2);
    }

    #[test]
    fn severities_order_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!(Severity::Warning.to_string(), "WARNING");
    }
}
