//! Redemption notifications.
//!
//! Provides:
//! - [`NotificationSink`], the seam the coordinator reports claims through
//! - [`WebhookNotifier`] posting Discord-style embeds with reseller attribution
//! - [`NoopNotifier`] for deployments without a webhook
//!
//! Delivery is best effort. A failed notification is reported to the caller
//! as a warning and never undoes a claim.

pub mod webhook;

use std::future::Future;

use keyclaim_core::config::NotificationConfig;

pub use webhook::WebhookNotifier;

/// Errors that can occur while delivering a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The notifier could not be built from configuration.
    #[error("notification configuration error: {0}")]
    Config(String),

    /// HTTP request to the webhook failed.
    #[error("webhook request error: {0}")]
    Request(String),

    /// The webhook returned a non-success status code.
    #[error("webhook error (status {status}): {body}")]
    ApiError { status: u16, body: String },
}

/// A completed redemption, as reported to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionEvent {
    pub serial: String,
    pub order_id: String,
    /// `None` for lifetime keys.
    pub key_duration: Option<String>,
    pub claimed_at: i64,
    pub identity: String,
    pub user_key: String,
    /// The identity held a trial account that was replaced.
    pub had_checkpoint: bool,
    pub banned: i64,
    pub status: String,
}

pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        event: &RedemptionEvent,
    ) -> impl Future<Output = Result<(), NotificationError>> + Send;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    async fn notify(&self, _event: &RedemptionEvent) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// The sink selected by configuration.
#[derive(Debug)]
pub enum Notifier {
    Webhook(WebhookNotifier),
    Noop(NoopNotifier),
}

impl Notifier {
    /// Build a webhook notifier when a URL is configured, else a no-op.
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotificationError> {
        match config.webhook_url.as_deref() {
            Some(url) if !url.is_empty() => Ok(Self::Webhook(WebhookNotifier::new(config)?)),
            _ => Ok(Self::Noop(NoopNotifier)),
        }
    }
}

impl NotificationSink for Notifier {
    async fn notify(&self, event: &RedemptionEvent) -> Result<(), NotificationError> {
        match self {
            Self::Webhook(webhook) => webhook.notify(event).await,
            Self::Noop(noop) => noop.notify(event).await,
        }
    }
}
