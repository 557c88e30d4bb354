//! Configuration file handling for relaymail.

use serde::{Deserialize, Deserializer};
use std::path::Path;

/// Server configuration. Every field has a default, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,
    #[serde(default = "Config::default_redis_url")]
    pub redis_url: String,
    #[serde(default = "Config::default_relay_port")]
    pub relay_port: u16,
    #[serde(default, deserialize_with = "deserialize_sequence")]
    pub local_domains: Vec<String>,
    #[serde(default = "Config::default_user_attempt_limit")]
    pub user_attempt_limit: i64,
    #[serde(default = "Config::default_ip_attempt_limit")]
    pub ip_attempt_limit: i64,
    #[serde(default = "Config::default_attempt_window_secs")]
    pub attempt_window_secs: u64,
    #[serde(default = "Config::default_fail_limit")]
    pub fail_limit: i64,
    #[serde(default = "Config::default_fail_window_secs")]
    pub fail_window_secs: u64,
    #[serde(default = "Config::default_lock_base_secs")]
    pub lock_base_secs: u64,
    #[serde(default = "Config::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "Config::default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default)]
    pub machine_id: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigWrapper {
    // The whole actual config is under `params` section.
    #[serde(default)]
    pub params: Config,
}

/// Custom deserializer to parse space-separated strings into [`Vec<String>`].
fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(v) => v
            .split(' ')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, crate::error::Error> {
        let content = std::fs::read_to_string(path)?;
        let wrapped_config: ConfigWrapper = serini::from_str(&content)?;
        Ok(wrapped_config.params)
    }

    /// Check whether a recipient domain is handled by local mailbox storage.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        !domain.is_empty() && self.local_domains.iter().any(|d| d == domain)
    }

    // Following are needed since serde does not support default literals.

    const fn default_smtp_port() -> u16 {
        8000
    }
    const fn default_http_port() -> u16 {
        9000
    }
    fn default_redis_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }
    const fn default_relay_port() -> u16 {
        25
    }
    const fn default_user_attempt_limit() -> i64 {
        5
    }
    const fn default_ip_attempt_limit() -> i64 {
        20
    }
    const fn default_attempt_window_secs() -> u64 {
        300
    }
    const fn default_fail_limit() -> i64 {
        5
    }
    const fn default_fail_window_secs() -> u64 {
        600
    }
    const fn default_lock_base_secs() -> u64 {
        10
    }
    const fn default_max_retries() -> u32 {
        5
    }
    const fn default_retry_backoff_secs() -> u64 {
        60
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smtp_port: Self::default_smtp_port(),
            http_port: Self::default_http_port(),
            redis_url: Self::default_redis_url(),
            relay_port: Self::default_relay_port(),
            local_domains: Vec::new(),
            user_attempt_limit: Self::default_user_attempt_limit(),
            ip_attempt_limit: Self::default_ip_attempt_limit(),
            attempt_window_secs: Self::default_attempt_window_secs(),
            fail_limit: Self::default_fail_limit(),
            fail_window_secs: Self::default_fail_window_secs(),
            lock_base_secs: Self::default_lock_base_secs(),
            max_retries: Self::default_max_retries(),
            retry_backoff_secs: Self::default_retry_backoff_secs(),
            machine_id: None,
        }
    }
}
