//! Luarmor-style user API client.
//!
//! All calls go to `{base_url}/v3/projects/{project_id}/users`, authenticated
//! by the raw API key in the `Authorization` header. Responses are JSON
//! envelopes carrying `success` and an optional `message`.
//!
//! Lookups and deletes are idempotent and retried with exponential backoff on
//! transient failures. Creates, updates and HWID resets are sent once.

use std::time::Duration;

use keyclaim_core::config::LicenseConfig;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{AccountUpdate, LicenseAccount, LicenseAuthority, LicenseError};

const BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct UsersEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    users: Vec<LicenseAccount>,
}

#[derive(Debug, Deserialize)]
struct CreateEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the licensing authority.
#[derive(Debug, Clone)]
pub struct LuarmorClient {
    http: reqwest::Client,
    users_url: String,
    max_attempts: u32,
}

impl LuarmorClient {
    pub fn new(config: &LicenseConfig) -> Result<Self, LicenseError> {
        if config.base_url.is_empty() {
            return Err(LicenseError::Config("base_url is empty".into()));
        }
        if config.project_id.is_empty() {
            return Err(LicenseError::Config("project_id is empty".into()));
        }
        if config.api_key.is_empty() {
            return Err(LicenseError::Config("api_key is empty".into()));
        }

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| LicenseError::Config("Invalid api_key format".into()))?;
        headers.insert(AUTHORIZATION, key);

        // reqwest is built with `rustls-no-provider`; `Err` means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LicenseError::Config(e.to_string()))?;

        let users_url = format!(
            "{}/v3/projects/{}/users",
            config.base_url.trim_end_matches('/'),
            config.project_id
        );

        Ok(Self {
            http,
            users_url,
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub fn users_url(&self) -> &str {
        &self.users_url
    }

    fn url_with(&self, params: &[(&str, &str)]) -> Result<Url, LicenseError> {
        Url::parse_with_params(&self.users_url, params)
            .map_err(|e| LicenseError::Config(format!("invalid users url: {e}")))
    }

    async fn get_users(&self, params: &[(&str, &str)]) -> Result<Vec<LicenseAccount>, LicenseError> {
        let url = &self.url_with(params)?;
        let envelope: UsersEnvelope = self
            .with_retry("lookup", || async move {
                let resp = self.http.get(url.clone()).send().await;
                read_json(resp).await
            })
            .await?;

        if !envelope.success {
            return Err(LicenseError::Rejected(
                envelope.message.unwrap_or_else(|| "lookup failed".into()),
            ));
        }
        Ok(envelope.users)
    }

    /// Run an idempotent call, retrying transient failures.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, LicenseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LicenseError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(op, attempt, error = %e, ?delay, "License API call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map a response to `T`, turning non-2xx statuses into `LicenseError::Api`.
async fn read_json<T: DeserializeOwned>(
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, LicenseError> {
    let resp = resp.map_err(|e| LicenseError::Request(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(LicenseError::Api {
            status: status.as_u16(),
            message,
        });
    }
    resp.json::<T>()
        .await
        .map_err(|e| LicenseError::Decode(e.to_string()))
}

fn check_status(envelope: StatusEnvelope, op: &str) -> Result<String, LicenseError> {
    let message = envelope.message.unwrap_or_default();
    if envelope.success {
        Ok(message)
    } else if message.is_empty() {
        Err(LicenseError::Rejected(format!("{op} failed")))
    } else {
        Err(LicenseError::Rejected(message))
    }
}

impl LicenseAuthority for LuarmorClient {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<LicenseAccount>, LicenseError> {
        let users = self.get_users(&[("discord_id", identity)]).await?;
        debug!(identity, found = users.len(), "License lookup by identity");
        Ok(users.into_iter().next())
    }

    async fn find_by_key(&self, user_key: &str) -> Result<Option<LicenseAccount>, LicenseError> {
        let users = self.get_users(&[("user_key", user_key)]).await?;
        Ok(users.into_iter().next())
    }

    async fn create_account(
        &self,
        identity: &str,
        note: &str,
        auth_expire: i64,
    ) -> Result<LicenseAccount, LicenseError> {
        let body = serde_json::json!({
            "discord_id": identity,
            "note": note,
            "auth_expire": auth_expire,
        });
        let resp = self.http.post(&self.users_url).json(&body).send().await;
        let envelope: CreateEnvelope = read_json(resp).await?;

        if !envelope.success {
            return Err(LicenseError::Rejected(
                envelope.message.unwrap_or_else(|| "create failed".into()),
            ));
        }
        let user_key = envelope
            .user_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LicenseError::Decode("create response has no user_key".into()))?;

        debug!(identity, auth_expire, "License account created");
        Ok(LicenseAccount {
            user_key,
            discord_id: identity.to_string(),
            auth_expire,
            note: note.to_string(),
            status: super::default_status(),
            banned: 0,
        })
    }

    async fn update_account(&self, user_key: &str, update: &AccountUpdate) -> Result<(), LicenseError> {
        let mut body = serde_json::to_value(update).map_err(|e| LicenseError::Decode(e.to_string()))?;
        body["user_key"] = serde_json::Value::String(user_key.to_string());

        let resp = self.http.patch(&self.users_url).json(&body).send().await;
        let envelope: StatusEnvelope = read_json(resp).await?;
        check_status(envelope, "update")?;
        debug!(user_key, "License account updated");
        Ok(())
    }

    async fn delete_account(&self, user_key: &str) -> Result<(), LicenseError> {
        let url = &self.url_with(&[("user_key", user_key)])?;
        let envelope: StatusEnvelope = self
            .with_retry("delete", || async move {
                let resp = self.http.delete(url.clone()).send().await;
                read_json(resp).await
            })
            .await?;
        check_status(envelope, "delete")?;
        debug!(user_key, "License account deleted");
        Ok(())
    }

    async fn reset_hwid(&self, user_key: &str, force: bool) -> Result<String, LicenseError> {
        let body = serde_json::json!({ "user_key": user_key, "force": force });
        let resp = self
            .http
            .post(format!("{}/resethwid", self.users_url))
            .json(&body)
            .send()
            .await;
        let envelope: StatusEnvelope = read_json(resp).await?;
        check_status(envelope, "hwid reset")
    }
}
