//! Environment-backed runtime configuration for the shell.

use std::{
    env,
    error::Error,
    fmt,
    path::PathBuf,
    time::Duration,
};

use client_core::{
    RetryPolicy,
    presence::{HEARTBEAT_INTERVAL_MS, TYPING_STALE_AFTER_MS},
    types::Identity,
};
use client_runtime::RuntimeConfig;

const DEFAULT_DATA_DIR: &str = "./.driftchat-shell-store";
const RECENT_CACHE_FILENAME: &str = ".driftchat-recent.json";
const DEFAULT_FEED_RETRY_BASE_MS: u64 = 500;
const DEFAULT_FEED_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_LOCAL_USER_ID: &str = "u-local";
const DEFAULT_LOCAL_DISPLAY_NAME: &str = "Local User";

/// Runtime configuration used by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Identity used by the local scripted provider.
    pub local_user_id: String,
    /// Display name of the local identity.
    pub local_display_name: String,
    /// Email of the local identity.
    pub local_email: Option<String>,
    /// Avatar URL of the local identity.
    pub local_avatar_url: Option<String>,
    /// Directory holding the recent-conversations cache.
    pub data_dir: PathBuf,
    /// Typing debounce/staleness window in milliseconds.
    pub typing_window_ms: u64,
    /// Presence heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Base delay for feed resubscribe backoff.
    pub feed_retry_base_ms: u64,
    /// Delay cap for feed resubscribe backoff.
    pub feed_retry_max_ms: u64,
}

impl ShellConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let local_user_id = optional_trimmed_env("DRIFTCHAT_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_LOCAL_USER_ID.to_owned());
        let local_display_name = optional_trimmed_env("DRIFTCHAT_DISPLAY_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_LOCAL_DISPLAY_NAME.to_owned());
        let local_email = optional_trimmed_env("DRIFTCHAT_EMAIL", &mut lookup);
        let local_avatar_url = optional_trimmed_env("DRIFTCHAT_AVATAR_URL", &mut lookup);

        let data_dir = optional_trimmed_env("DRIFTCHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let typing_window_ms = parse_optional_u64(
            "DRIFTCHAT_TYPING_WINDOW_MS",
            TYPING_STALE_AFTER_MS,
            &mut lookup,
        )?;
        let heartbeat_interval_ms = parse_optional_u64(
            "DRIFTCHAT_HEARTBEAT_INTERVAL_MS",
            HEARTBEAT_INTERVAL_MS,
            &mut lookup,
        )?;
        let feed_retry_base_ms = parse_optional_u64(
            "DRIFTCHAT_FEED_RETRY_BASE_MS",
            DEFAULT_FEED_RETRY_BASE_MS,
            &mut lookup,
        )?;
        let feed_retry_max_ms = parse_optional_u64(
            "DRIFTCHAT_FEED_RETRY_MAX_MS",
            DEFAULT_FEED_RETRY_MAX_MS,
            &mut lookup,
        )?;

        if typing_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DRIFTCHAT_TYPING_WINDOW_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DRIFTCHAT_HEARTBEAT_INTERVAL_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if feed_retry_max_ms < feed_retry_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "DRIFTCHAT_FEED_RETRY_MAX_MS",
                value: feed_retry_max_ms.to_string(),
                reason: "must not be below DRIFTCHAT_FEED_RETRY_BASE_MS".to_owned(),
            });
        }

        Ok(Self {
            local_user_id,
            local_display_name,
            local_email,
            local_avatar_url,
            data_dir,
            typing_window_ms,
            heartbeat_interval_ms,
            feed_retry_base_ms,
            feed_retry_max_ms,
        })
    }

    /// Runtime tuning derived from this configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            typing_window: Duration::from_millis(self.typing_window_ms),
            feed_retry: RetryPolicy::new(
                Duration::from_millis(self.feed_retry_base_ms),
                Duration::from_millis(self.feed_retry_max_ms),
            ),
        }
    }

    /// Identity handed to the local scripted provider.
    pub fn local_identity(&self) -> Identity {
        Identity {
            id: self.local_user_id.clone(),
            display_name: self.local_display_name.clone(),
            email: self
                .local_email
                .clone()
                .unwrap_or_else(|| format!("{}@driftchat.local", self.local_user_id)),
            avatar_url: self.local_avatar_url.clone(),
        }
    }

    /// Location of the recent-conversations cache file.
    pub fn recent_cache_path(&self) -> PathBuf {
        self.data_dir.join(RECENT_CACHE_FILENAME)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, path::Path};

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ShellConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        ShellConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn falls_back_to_design_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.typing_window_ms, TYPING_STALE_AFTER_MS);
        assert_eq!(cfg.heartbeat_interval_ms, HEARTBEAT_INTERVAL_MS);
        assert_eq!(cfg.data_dir, Path::new(DEFAULT_DATA_DIR));
        assert_eq!(cfg.local_user_id, DEFAULT_LOCAL_USER_ID);
    }

    #[test]
    fn parses_identity_and_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("DRIFTCHAT_USER_ID", "u-alice"),
            ("DRIFTCHAT_DISPLAY_NAME", "Alice"),
            ("DRIFTCHAT_EMAIL", "alice@example.org"),
            ("DRIFTCHAT_TYPING_WINDOW_MS", "2000"),
            ("DRIFTCHAT_HEARTBEAT_INTERVAL_MS", "60000"),
            ("DRIFTCHAT_DATA_DIR", "/tmp/driftchat"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.typing_window_ms, 2_000);
        assert_eq!(cfg.heartbeat_interval_ms, 60_000);
        let identity = cfg.local_identity();
        assert_eq!(identity.id, "u-alice");
        assert_eq!(identity.email, "alice@example.org");
        assert_eq!(
            cfg.recent_cache_path(),
            Path::new("/tmp/driftchat/.driftchat-recent.json")
        );
    }

    #[test]
    fn derives_a_local_email_when_unset() {
        let cfg = config_from_pairs(&[("DRIFTCHAT_USER_ID", "u-alice")])
            .expect("config should parse");
        assert_eq!(cfg.local_identity().email, "u-alice@driftchat.local");
    }

    #[test]
    fn rejects_zero_windows_and_inverted_retry_bounds() {
        let err = config_from_pairs(&[("DRIFTCHAT_TYPING_WINDOW_MS", "0")])
            .expect_err("zero typing window should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DRIFTCHAT_TYPING_WINDOW_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("DRIFTCHAT_FEED_RETRY_BASE_MS", "5000"),
            ("DRIFTCHAT_FEED_RETRY_MAX_MS", "100"),
        ])
        .expect_err("inverted retry bounds should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DRIFTCHAT_FEED_RETRY_MAX_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = config_from_pairs(&[("DRIFTCHAT_HEARTBEAT_INTERVAL_MS", "soon")])
            .expect_err("invalid number should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DRIFTCHAT_HEARTBEAT_INTERVAL_MS",
                ..
            }
        ));
    }
}
