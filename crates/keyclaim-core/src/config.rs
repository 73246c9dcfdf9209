//! Configuration resolution for keyclaim.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/keyclaim/config.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//!
//! CLI arguments are applied on top by the binary.
//!
//! Files are merged table-by-table before deserializing, so an overlay only
//! needs to mention the keys it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete keyclaim configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub lease: LeaseConfig,
    pub license: LicenseConfig,
    pub notifications: NotificationConfig,
    /// Per-bucket overrides of the built-in rate-limit table.
    pub rate_limits: BTreeMap<String, BucketConfig>,
    /// Identities that bypass HWID reset cooldowns and ownership checks.
    pub admins: Vec<String>,
    /// Identities that may never redeem.
    pub blocked_identities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

/// Reservation lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a reservation blocks other identities, in seconds.
    pub seconds: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { seconds: 5 }
    }
}

/// External licensing authority settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub base_url: String,
    pub project_id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub timeout_secs: u64,
    /// Attempts for idempotent calls (lookups, deletes).
    pub max_attempts: u32,
    /// Accounts whose note starts with this prefix are trial accounts.
    pub checkpoint_note_prefix: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.luarmor.net".to_string(),
            project_id: String::new(),
            api_key: String::new(),
            timeout_secs: 10,
            max_attempts: 3,
            checkpoint_note_prefix: "Ad Reward".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook receiving redemption events. Notifications are disabled when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub resellers: Vec<ResellerConfig>,
}

/// A reseller recognised by a substring of the purchase order id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResellerConfig {
    /// Lower-case substring matched against the order id.
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Fixed-window limit for one bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
    pub max_requests: u32,
    pub window_secs: i64,
}

/// Load configuration with hierarchical resolution.
///
/// A missing global file is skipped; a missing explicit file is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_tables(&mut merged, read_table(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_tables(&mut merged, read_table(path)?);
    }

    let mut config: Config = merged.try_into()?;
    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".keyclaim").join("config.toml"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/keyclaim/config.toml"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("keyclaim").join("config.toml"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`; overlay wins on scalar conflicts.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("KEYCLAIM_DB_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("KEYCLAIM_LEASE_SECS") {
        if let Ok(n) = val.parse() {
            config.lease.seconds = n;
        }
    }
    if let Ok(val) = std::env::var("KEYCLAIM_LICENSE_URL") {
        config.license.base_url = val;
    }
    if let Ok(val) = std::env::var("KEYCLAIM_LICENSE_PROJECT_ID") {
        config.license.project_id = val;
    }
    if let Ok(val) = std::env::var("KEYCLAIM_LICENSE_API_KEY") {
        config.license.api_key = val;
    }
    if let Ok(val) = std::env::var("KEYCLAIM_WEBHOOK_URL") {
        config.notifications.webhook_url = Some(val);
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.lease.seconds <= 0 {
        return Err(Error::Config("lease.seconds must be positive".into()));
    }
    if config.license.max_attempts == 0 {
        return Err(Error::Config("license.max_attempts must be at least 1".into()));
    }
    for (name, bucket) in &config.rate_limits {
        if bucket.max_requests == 0 || bucket.window_secs <= 0 {
            return Err(Error::Config(format!(
                "rate_limits.{name}: max_requests and window_secs must be positive"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_is_five_seconds() {
        let config = Config::default();
        assert_eq!(config.lease.seconds, 5);
        assert_eq!(config.license.checkpoint_note_prefix, "Ad Reward");
    }

    #[test]
    fn overlay_only_replaces_mentioned_keys() {
        let mut base: toml::Table = r#"
            [license]
            project_id = "abc"
            timeout_secs = 30
        "#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
            [license]
            timeout_secs = 5
        "#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config: Config = base.try_into().unwrap();
        assert_eq!(config.license.project_id, "abc");
        assert_eq!(config.license.timeout_secs, 5);
        assert_eq!(config.license.max_attempts, 3);
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyclaim.toml");
        std::fs::write(
            &path,
            r#"
                admins = ["42"]

                [rate_limits.redeemkey]
                max_requests = 3
                window_secs = 60

                [[notifications.resellers]]
                key = "bloxproducts"
                name = "Bloxproducts"
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.admins, ["42"]);
        assert_eq!(
            config.rate_limits.get("redeemkey"),
            Some(&BucketConfig {
                max_requests: 3,
                window_secs: 60
            })
        );
        assert_eq!(config.notifications.resellers[0].name, "Bloxproducts");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/keyclaim.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../../../keyclaim.example.toml")).unwrap();
        assert_eq!(config.notifications.resellers.len(), 5);
        assert_eq!(config.rate_limits["hwidreset_success"].window_secs, 21_600);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut config = Config::default();
        config.rate_limits.insert(
            "suggestions".into(),
            BucketConfig {
                max_requests: 1,
                window_secs: 0,
            },
        );
        assert!(validate(&config).is_err());
    }
}
