//! Engine configuration.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Static configuration injected into every engine component.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Identities allowed to run admin actions.
    #[serde(default, deserialize_with = "comma_list")]
    pub admin_ids: Vec<String>,

    /// Points spent per credit set.
    #[serde(default = "default_points_per_credit_set")]
    pub points_per_credit_set: u64,

    /// Credits gained per credit set.
    #[serde(default = "default_credits_per_set")]
    pub credits_per_set: u64,

    /// Credits spent per leased number.
    #[serde(default = "default_credits_per_number")]
    pub credits_per_number: u64,

    #[serde(default = "default_one")]
    pub referral_bonus_points: u64,

    #[serde(default = "default_one")]
    pub daily_bonus_points: u64,

    #[serde(default = "default_daily_bonus_interval", with = "humantime_serde")]
    pub daily_bonus_interval: Duration,

    /// Minimum time between two number purchases by one account.
    #[serde(default = "default_allocation_cooldown", with = "humantime_serde")]
    pub allocation_cooldown: Duration,

    /// Minimum time between two OTP refreshes by one account.
    #[serde(default = "default_otp_refresh_cooldown", with = "humantime_serde")]
    pub otp_refresh_cooldown: Duration,

    /// Interval of the background message poll.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How far back the first poll of a number looks.
    #[serde(default = "default_initial_lookback", with = "humantime_serde")]
    pub initial_lookback: Duration,

    /// ISO country code numbers are listed in.
    #[serde(default = "default_number_region")]
    pub number_region: String,

    #[serde(default = "default_available_numbers_limit")]
    pub available_numbers_limit: u32,

    /// Messages shown by an OTP refresh.
    #[serde(default = "default_recent_messages_limit")]
    pub recent_messages_limit: u32,

    /// Messages fetched per number per poll.
    #[serde(default = "default_poll_messages_limit")]
    pub poll_messages_limit: u32,

    /// Public URL of the SMS webhook handed to the provider on purchase.
    #[serde(default)]
    pub inbound_callback_url: Option<String>,

    /// Optional audit chat every delivered OTP is copied to.
    #[serde(default)]
    pub broadcast_target: Option<String>,

    /// Refuse to re-purchase a number the account has held before.
    #[serde(default = "default_true")]
    pub track_purchase_history: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

/// Store persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub persist: bool,

    /// Passphrase the snapshot encryption key is derived from.
    #[serde(default)]
    pub encryption_key: Option<SecretString>,
}

/// Webhook HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl EngineConfig {
    pub fn is_admin(&self, id: &str) -> bool {
        self.admin_ids.iter().any(|a| a == id)
    }
}

// Default implementations
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_ids: Vec::new(),
            points_per_credit_set: default_points_per_credit_set(),
            credits_per_set: default_credits_per_set(),
            credits_per_number: default_credits_per_number(),
            referral_bonus_points: default_one(),
            daily_bonus_points: default_one(),
            daily_bonus_interval: default_daily_bonus_interval(),
            allocation_cooldown: default_allocation_cooldown(),
            otp_refresh_cooldown: default_otp_refresh_cooldown(),
            poll_interval: default_poll_interval(),
            initial_lookback: default_initial_lookback(),
            number_region: default_number_region(),
            available_numbers_limit: default_available_numbers_limit(),
            recent_messages_limit: default_recent_messages_limit(),
            poll_messages_limit: default_poll_messages_limit(),
            inbound_callback_url: None,
            broadcast_target: None,
            track_purchase_history: true,
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            persist: true,
            encryption_key: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_server_port(),
        }
    }
}

// Default value functions
fn default_points_per_credit_set() -> u64 {
    15
}

fn default_credits_per_set() -> u64 {
    3
}

fn default_credits_per_number() -> u64 {
    1
}

fn default_one() -> u64 {
    1
}

fn default_daily_bonus_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_allocation_cooldown() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_otp_refresh_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_initial_lookback() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_number_region() -> String {
    "CA".into()
}

fn default_available_numbers_limit() -> u32 {
    20
}

fn default_recent_messages_limit() -> u32 {
    5
}

fn default_poll_messages_limit() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/data/otp-store.enc")
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_server_port() -> u16 {
    8080
}

/// Accept either a sequence or a comma-separated string.
///
/// Environment sources are read with parsing disabled so E.164 numbers
/// keep their `+`, which leaves lists as plain strings.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };

    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.points_per_credit_set, 15);
        assert_eq!(config.credits_per_set, 3);
        assert_eq!(config.credits_per_number, 1);
        assert_eq!(config.allocation_cooldown, Duration::from_secs(300));
        assert_eq!(config.otp_refresh_cooldown, Duration::from_secs(30));
        assert_eq!(config.number_region, "CA");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_admin_ids_from_joined_string() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "admin_ids": "+15550001, +15550002,,"
        }))
        .unwrap();

        assert_eq!(config.admin_ids, vec!["+15550001", "+15550002"]);
        assert!(config.is_admin("+15550002"));
        assert!(!config.is_admin("+15550003"));
    }

    #[test]
    fn test_humantime_fields() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "allocation_cooldown": "10m",
            "retry": { "initial_backoff": "50ms" }
        }))
        .unwrap();

        assert_eq!(config.allocation_cooldown, Duration::from_secs(600));
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.retry.max_attempts, 3);
    }
}
