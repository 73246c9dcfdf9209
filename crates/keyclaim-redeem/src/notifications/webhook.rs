//! Discord-style webhook notifier.
//!
//! Each redemption is posted as one embed. When the lower-cased order id
//! contains a configured reseller key, the message is sent under the
//! reseller's name and avatar; other orders are attributed to the official
//! shop.

use std::time::Duration;

use keyclaim_core::config::{NotificationConfig, ResellerConfig};
use serde::Serialize;
use tracing::{debug, warn};

use super::{NotificationError, NotificationSink, RedemptionEvent};

const RESELLER_COLOR: u32 = 5_814_783;
const OFFICIAL_COLOR: u32 = 55_295;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Webhook request body.
#[derive(Debug, Serialize)]
pub struct WebhookMessage {
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn new(name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline,
        }
    }
}

#[derive(Debug)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    resellers: Vec<ResellerConfig>,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let url = config
            .webhook_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NotificationError::Config("webhook_url is not set".into()))?;

        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()
            .map_err(|e| NotificationError::Config(e.to_string()))?;

        let resellers = config
            .resellers
            .iter()
            .map(|r| ResellerConfig {
                key: r.key.to_lowercase(),
                ..r.clone()
            })
            .collect();

        Ok(Self {
            http,
            url,
            resellers,
        })
    }

    /// The first reseller whose key occurs in `order_id`, case-insensitively.
    pub fn reseller_for(&self, order_id: &str) -> Option<&ResellerConfig> {
        let order_id = order_id.to_lowercase();
        self.resellers
            .iter()
            .find(|r| !r.key.is_empty() && order_id.contains(&r.key))
    }

    pub fn build_message(&self, event: &RedemptionEvent) -> WebhookMessage {
        let fields = embed_fields(event);

        match self.reseller_for(&event.order_id) {
            Some(reseller) => WebhookMessage {
                content: None,
                username: Some(reseller.name.clone()),
                avatar_url: reseller.avatar_url.clone(),
                embeds: vec![Embed {
                    title: format!("{} - key redeemed!", reseller.name),
                    description: format!(
                        "A key was purchased & redeemed via the __{}__ reseller.",
                        reseller.name
                    ),
                    color: RESELLER_COLOR,
                    fields,
                }],
            },
            None => WebhookMessage {
                content: None,
                username: None,
                avatar_url: None,
                embeds: vec![Embed {
                    title: "key redeemed!".to_string(),
                    description:
                        "A key was purchased & redeemed via the official shop or an untracked reseller."
                            .to_string(),
                    color: OFFICIAL_COLOR,
                    fields,
                }],
            },
        }
    }
}

fn embed_fields(event: &RedemptionEvent) -> Vec<EmbedField> {
    let duration = event.key_duration.as_deref().unwrap_or("Lifetime");
    let at = event.claimed_at;

    vec![
        EmbedField::new("Serial", format!("||{}||", event.serial), true),
        EmbedField::new("Order ID", format!("||{}||", event.order_id), true),
        EmbedField::new(
            format!("Key duration: {duration}"),
            format!("Claimed at: <t:{at}:d><t:{at}:T>"),
            true,
        ),
        EmbedField::new(
            "Discord",
            format!("<@{id}> ({id})", id = event.identity),
            true,
        ),
        EmbedField::new("License key", format!("||{}||", event.user_key), true),
        EmbedField::new("Had trial key?", event.had_checkpoint.to_string(), true),
        EmbedField::new("Banned?", event.banned.to_string(), false),
        EmbedField::new("Status", event.status.clone(), false),
    ]
}

impl NotificationSink for WebhookNotifier {
    async fn notify(&self, event: &RedemptionEvent) -> Result<(), NotificationError> {
        let message = self.build_message(event);
        let response = self
            .http
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| NotificationError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(serial = %event.serial, "Redemption webhook sent");
            Ok(())
        } else {
            let status_code = status.as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            warn!(status = status_code, body = %body, "Webhook returned error");
            Err(NotificationError::ApiError {
                status: status_code,
                body,
            })
        }
    }
}
