//! Resolver timing configuration.
//!
//! Sources (highest wins):
//! 1. Environment variables (`TRADEPOST_` prefix, `__` nests sections)
//! 2. `tradepost.toml` in the working directory, if present
//! 3. Built-in defaults
//!
//! Example: `TRADEPOST_IDENTITY__FETCH_TIMEOUT_MS=4000`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILE: &str = "tradepost.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level document; the resolver reads the `[identity]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TradepostConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Timeouts and windows used by the identity resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Age after which a cached identity triggers a background refresh.
    pub cache_ttl_secs: u64,
    /// Ceiling for the three parallel directory queries.
    pub fetch_timeout_ms: u64,
    /// Delay before the single automatic retry.
    pub retry_delay_ms: u64,
    /// How long to wait for the session credential to be attached.
    pub attach_wait_ms: u64,
    pub attach_poll_ms: u64,
    /// Cold-start session read timeout.
    pub session_read_timeout_ms: u64,
    /// Hard ceiling after which cold start stops reporting `loading`.
    pub loading_ceiling_ms: u64,
    /// How long sign-out waits for the remote call.
    pub sign_out_timeout_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 120,
            fetch_timeout_ms: 10_000,
            retry_delay_ms: 700,
            attach_wait_ms: 2_000,
            attach_poll_ms: 100,
            session_read_timeout_ms: 3_000,
            loading_ceiling_ms: 5_000,
            sign_out_timeout_ms: 1_500,
        }
    }
}

impl IdentityConfig {
    /// Load from defaults, `tradepost.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Same as [`IdentityConfig::load`] with an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config: TradepostConfig = Self::figment(path).extract()?;
        config.identity.validate()?;
        Ok(config.identity)
    }

    /// The provider chain, exposed so tests can inspect or extend it.
    pub fn figment(path: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(TradepostConfig::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(PathBuf::from(path)));
        }
        figment.merge(Env::prefixed("TRADEPOST_").split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("attach_poll_ms", self.attach_poll_ms),
            ("session_read_timeout_ms", self.session_read_timeout_ms),
            ("loading_ceiling_ms", self.loading_ceiling_ms),
            ("sign_out_timeout_ms", self.sign_out_timeout_ms),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue {
                field: (*field).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.loading_ceiling_ms < self.session_read_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "loading_ceiling_ms".to_string(),
                reason: format!(
                    "must not be shorter than session_read_timeout_ms ({})",
                    self.session_read_timeout_ms
                ),
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.cache_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn attach_wait(&self) -> Duration {
        Duration::from_millis(self.attach_wait_ms)
    }

    pub fn attach_poll(&self) -> Duration {
        Duration::from_millis(self.attach_poll_ms)
    }

    pub fn session_read_timeout(&self) -> Duration {
        Duration::from_millis(self.session_read_timeout_ms)
    }

    pub fn loading_ceiling(&self) -> Duration {
        Duration::from_millis(self.loading_ceiling_ms)
    }

    pub fn sign_out_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_out_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = IdentityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), chrono::Duration::minutes(2));
        assert_eq!(config.retry_delay(), Duration::from_millis(700));
    }

    #[test]
    fn toml_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tradepost.toml",
                r#"
                [identity]
                fetch_timeout_ms = 4000
                retry_delay_ms = 250
                "#,
            )?;
            jail.set_env("TRADEPOST_IDENTITY__RETRY_DELAY_MS", "900");

            let config = IdentityConfig::load().expect("config loads");
            assert_eq!(config.fetch_timeout_ms, 4000);
            assert_eq!(config.retry_delay_ms, 900);
            assert_eq!(config.sign_out_timeout_ms, 1_500);
            Ok(())
        });
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = IdentityConfig {
            fetch_timeout_ms: 0,
            ..IdentityConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fetch_timeout_ms"));
    }

    #[test]
    fn ceiling_shorter_than_session_read_is_rejected() {
        let config = IdentityConfig {
            loading_ceiling_ms: 1_000,
            ..IdentityConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "loading_ceiling_ms"
        ));
    }
}
