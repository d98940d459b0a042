//! Service configuration, loaded from a TOML file.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Public DNS name this instance is reachable at
    pub host: String,
    pub service_port: u16,
    pub db_file: String,
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Profile image used for feed accounts that don't have one of their own
    #[serde(default)]
    pub fallback_profile_pic: String,
    pub update_schedule: UpdateSchedule,
    /// Number of toots always kept per account, regardless of age
    pub posts_min_count_kept: usize,
    /// Toots younger than this many days are never purged
    pub posts_min_days_kept: u32,
    /// Delay before a purge routine starts working, in seconds
    #[serde(default)]
    pub purge_wait_sec: u64,
    /// Optional file with one blocked feed URL per line (scheme-stripped)
    #[serde(default)]
    pub blocked_feeds_file: String,
    #[serde(default)]
    pub cache_page_templates: bool,
    pub birb: BirbConfig,
    pub secrets: Secrets,
}

/// Hours until the next feed check, keyed by how long the feed has been idle.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct UpdateSchedule {
    /// Feed changed within the last day
    pub day: u32,
    /// ... within the last week
    pub week: u32,
    /// ... within the last four weeks
    pub weeks4: u32,
    /// Idle for longer than four weeks
    pub older: u32,
}

/// The built-in actor that accepts feed requests.
#[derive(Clone, Debug, Deserialize)]
pub struct BirbConfig {
    pub user: String,
    pub published: DateTime<Utc>,
    #[serde(default)]
    pub manually_approves_follows: bool,
    pub pub_key: String,
    /// Passphrase-encrypted private key PEM; never stored in the database
    pub priv_key: String,
    #[serde(default)]
    pub profile_pic: String,
    #[serde(default)]
    pub header_pic: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Secrets {
    pub birb_privkey_passphrase: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub metrics_auth: String,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    /// Reads and parses the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, AppError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Internal(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&raw).map_err(|e| AppError::Internal(format!("invalid config: {}", e)))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "test-parrot.net".to_owned(),
        service_port: 0,
        db_file: String::new(),
        log_file: String::new(),
        log_level: "info".to_owned(),
        fallback_profile_pic: "https://test-parrot.net/static/fallback.png".to_owned(),
        update_schedule: UpdateSchedule {
            day: 1,
            week: 3,
            weeks4: 6,
            older: 12,
        },
        posts_min_count_kept: 5,
        posts_min_days_kept: 2,
        purge_wait_sec: 0,
        blocked_feeds_file: String::new(),
        cache_page_templates: false,
        birb: BirbConfig {
            user: "birb".to_owned(),
            published: chrono::Utc::now(),
            manually_approves_follows: false,
            pub_key: String::new(),
            priv_key: String::new(),
            profile_pic: String::new(),
            header_pic: String::new(),
        },
        secrets: Secrets {
            birb_privkey_passphrase: "test-passphrase".to_owned(),
            api_keys: vec!["test-api-key".to_owned()],
            metrics_auth: String::new(),
        },
    }
}
