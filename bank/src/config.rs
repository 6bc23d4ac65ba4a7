#![allow(dead_code)]

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

/// Top-level configuration tree for the bank process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub accounts: AccountsConfig,
    pub tan: TanConfig,
    pub gc: GcConfig,
    pub http: HttpConfig,
}

/// Database configuration.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Custom Debug that redacts the connection URL (carries credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Defaults applied when creating new accounts.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_max_debt_val")]
    pub default_max_debt_val: u64,
    #[serde(default)]
    pub default_max_debt_frac: u32,
    #[serde(default = "default_admin_login")]
    pub admin_login: String,
}

/// TAN challenge defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct TanConfig {
    #[serde(default = "default_tan_validity_secs")]
    pub validity_secs: i64,
    #[serde(default = "default_tan_retries")]
    pub retries: i32,
    #[serde(default = "default_tan_retransmission_secs")]
    pub retransmission_secs: i64,
}

/// Garbage-collection thresholds and interval.
#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_gc_abort_after_secs")]
    pub abort_after_secs: i64,
    #[serde(default = "default_gc_clean_after_secs")]
    pub clean_after_secs: i64,
    #[serde(default = "default_gc_delete_after_secs")]
    pub delete_after_secs: i64,
}

/// Ambient HTTP surface bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_debt_val() -> u64 {
    0
}

fn default_admin_login() -> String {
    "admin".to_string()
}

fn default_tan_validity_secs() -> i64 {
    300
}

fn default_tan_retries() -> i32 {
    3
}

fn default_tan_retransmission_secs() -> i64 {
    30
}

fn default_gc_interval_secs() -> u64 {
    3600
}

fn default_gc_abort_after_secs() -> i64 {
    3600
}

fn default_gc_clean_after_secs() -> i64 {
    7 * 24 * 3600
}

fn default_gc_delete_after_secs() -> i64 {
    365 * 24 * 3600
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    /// Loads configuration from the environment, reading a `.env` file
    /// first if one is present.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {path}"))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_max_connections()),
        };

        let accounts = AccountsConfig {
            default_max_debt_val: env::var("DEFAULT_MAX_DEBT_VAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_max_debt_val()),
            default_max_debt_frac: env::var("DEFAULT_MAX_DEBT_FRAC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            admin_login: env::var("ADMIN_LOGIN").unwrap_or_else(|_| default_admin_login()),
        };

        let tan = TanConfig {
            validity_secs: env::var("TAN_VALIDITY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_tan_validity_secs()),
            retries: env::var("TAN_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_tan_retries()),
            retransmission_secs: env::var("TAN_RETRANSMISSION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_tan_retransmission_secs()),
        };

        let gc = GcConfig {
            interval_secs: env::var("GC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_gc_interval_secs()),
            abort_after_secs: env::var("GC_ABORT_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_gc_abort_after_secs()),
            clean_after_secs: env::var("GC_CLEAN_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_gc_clean_after_secs()),
            delete_after_secs: env::var("GC_DELETE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_gc_delete_after_secs()),
        };

        let http = HttpConfig {
            bind_address: env::var("HTTP_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
        };

        let config = Config {
            database,
            accounts,
            tan,
            gc,
            http,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.accounts.admin_login.is_empty() {
            return Err(eyre!("accounts.admin_login cannot be empty"));
        }
        if self.tan.validity_secs <= 0 {
            return Err(eyre!("tan.validity_secs must be positive"));
        }
        if self.tan.retries <= 0 {
            return Err(eyre!("tan.retries must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/regiobank".to_string(),
                max_connections: 10,
            },
            accounts: AccountsConfig {
                default_max_debt_val: 0,
                default_max_debt_frac: 0,
                admin_login: "admin".to_string(),
            },
            tan: TanConfig {
                validity_secs: 300,
                retries: 3,
                retransmission_secs: 30,
            },
            gc: GcConfig {
                interval_secs: 3600,
                abort_after_secs: 3600,
                clean_after_secs: 604_800,
                delete_after_secs: 31_536_000,
            },
            http: HttpConfig {
                bind_address: "0.0.0.0:8080".to_string(),
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn empty_database_url_is_rejected() {
        let mut config = base_config();
        config.database.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_tan_retries_is_rejected() {
        let mut config = base_config();
        config.tan.retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn database_debug_redacts_url() {
        let config = base_config();
        let rendered = format!("{:?}", config.database);
        assert!(!rendered.contains("regiobank"));
        assert!(rendered.contains("<redacted>"));
    }
}
