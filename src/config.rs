//! Configuration for the Gmail synchronization engine (spec §6).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SyncError};

/// Process-wide configuration, resolved from a TOML file with environment overrides for
/// secrets. Every key in spec §6 is represented; an unrecognized key in the TOML document
/// is a hard configuration error (`#[serde(deny_unknown_fields)]` at each level).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    /// CLIENT_ID
    #[serde(default)]
    pub client_id: String,
    /// CLIENT_SECRET
    #[serde(default)]
    pub client_secret: String,
    /// CALLBACK_URL — where Google redirects after consent.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
    /// REDIRECT_URL — where the host redirects the user after a successful callback.
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            callback_url: default_callback_url(),
            redirect_url: default_redirect_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// UNREAD_LABEL — the remote label id that is a pure read-flag, never stored as a Label row.
    #[serde(default = "default_unread_label")]
    pub unread_label: String,
    /// SYNC_LOCK_LIFETIME — advisory lock TTL in seconds.
    #[serde(default = "default_sync_lock_lifetime")]
    pub sync_lock_lifetime_secs: u64,
    /// KV_STORE_URL — backing store for SyncLock.
    #[serde(default = "default_kv_store_url")]
    pub kv_store_url: String,
    /// GMAIL_CHUNK_SIZE — resumable-upload chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub gmail_chunk_size: usize,
    /// Scheduler period in seconds (spec §4.6: "every 20s").
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            unread_label: default_unread_label(),
            sync_lock_lifetime_secs: default_sync_lock_lifetime(),
            kv_store_url: default_kv_store_url(),
            gmail_chunk_size: default_chunk_size(),
            scheduler_interval_secs: default_scheduler_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// EMAIL_ATTACHMENT_UPLOAD_TO — path template, e.g. `downloads/attachments/{message_id}/{filename}`.
    #[serde(default = "default_attachment_upload_to")]
    pub email_attachment_upload_to: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            email_attachment_upload_to: default_attachment_upload_to(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// AMQP URL for the task broker (§6).
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Default per-task retry delay in seconds (§4.6: 30s).
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            default_retry_delay_secs: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_breaker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_breaker_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Gmail quota units refilled per second (default per Google: 250).
    #[serde(default = "default_quota_refill_rate")]
    pub refill_rate: f64,
    /// Burst capacity in quota units (default: 500, i.e. 2 seconds worth).
    #[serde(default = "default_quota_max_units")]
    pub max_units: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            refill_rate: default_quota_refill_rate(),
            max_units: default_quota_max_units(),
        }
    }
}

fn default_callback_url() -> String {
    "http://localhost:8080/oauth2/callback".to_string()
}

fn default_redirect_url() -> String {
    "/mail".to_string()
}

fn default_unread_label() -> String {
    "UNREAD".to_string()
}

fn default_sync_lock_lifetime() -> u64 {
    3600
}

fn default_kv_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_scheduler_interval() -> u64 {
    20
}

fn default_attachment_upload_to() -> String {
    "downloads/attachments/{message_id}/{filename}".to_string()
}

fn default_broker_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_retry_delay() -> u64 {
    30
}

fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_quota_refill_rate() -> f64 {
    250.0
}

fn default_quota_max_units() -> f64 {
    500.0
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::ConfigError(format!("failed to read config file: {}", e)))?;

        let mut settings: Self = toml::from_str(&content)
            .map_err(|e| SyncError::ConfigError(format!("failed to parse config file: {}", e)))?;

        settings.apply_env_overrides();
        settings.validate()?;

        tracing::info!("loaded configuration from {:?}", path);
        Ok(settings)
    }

    /// CLIENT_ID / CLIENT_SECRET are commonly supplied via environment rather than committed
    /// to a config file; environment values win when present.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CLIENT_ID") {
            self.oauth.client_id = id;
        }
        if let Ok(secret) = std::env::var("CLIENT_SECRET") {
            self.oauth.client_secret = secret;
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::ConfigError(format!("failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::ConfigError(format!("failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| SyncError::ConfigError(format!("failed to write config file: {}", e)))?;

        tracing::info!("saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values beyond what serde's type system already enforces.
    pub fn validate(&self) -> Result<()> {
        if self.sync.sync_lock_lifetime_secs == 0 {
            return Err(SyncError::ConfigError(
                "sync.sync_lock_lifetime_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.gmail_chunk_size == 0 {
            return Err(SyncError::ConfigError(
                "sync.gmail_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.sync.unread_label.is_empty() {
            return Err(SyncError::ConfigError(
                "sync.unread_label cannot be empty".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(SyncError::ConfigError(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout_secs == 0 {
            return Err(SyncError::ConfigError(
                "circuit_breaker.reset_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.quota.refill_rate <= 0.0 || self.quota.max_units <= 0.0 {
            return Err(SyncError::ConfigError(
                "quota.refill_rate and quota.max_units must be positive".to_string(),
            ));
        }

        tracing::debug!("configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file for operators to edit.
    pub async fn create_example(path: &Path) -> Result<()> {
        let settings = Self::default();
        settings.save(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.sync.unread_label, "UNREAD");
        assert_eq!(settings.sync.sync_lock_lifetime_secs, 3600);
        assert_eq!(settings.sync.gmail_chunk_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.toml"))
            .await
            .unwrap();
        assert_eq!(settings.sync.unread_label, "UNREAD");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let file = NamedTempFile::new().unwrap();
        let mut settings = Settings::default();
        settings.oauth.client_id = "abc123".to_string();
        settings.save(file.path()).await.unwrap();

        let loaded = Settings::load(file.path()).await.unwrap();
        assert_eq!(loaded.oauth.client_id, "abc123");
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), "[sync]\nbogus_key = 1\n")
            .await
            .unwrap();
        let result = Settings::load(file.path()).await;
        assert!(result.is_err());
    }

    #[test]
    fn zero_lock_lifetime_rejected() {
        let mut settings = Settings::default();
        settings.sync.sync_lock_lifetime_secs = 0;
        assert!(settings.validate().is_err());
    }
}
