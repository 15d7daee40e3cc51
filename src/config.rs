//! Startup configuration
//!
//! A single YAML file read once at startup. Every field has a default, so an
//! empty file (or one that only overrides a few values) is valid:
//!
//! ```yaml
//! server:
//!   port: 8080
//! policy:
//!   restaurant_discount: "0.15"
//!   min_post_payment_balance: "1.00"
//! reconciler:
//!   pending_threshold_secs: 30
//! ```
//!
//! Monetary policy values are decimal strings with at most two places.

use crate::core::policy::Policy;
use crate::core::reconciler::ReconcilerConfig;
use crate::types::{Coins, MerchantId, UserId};
use chrono::FixedOffset;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Endpoint that selects the in-process ledger or record store.
pub const IN_MEMORY_ENDPOINT: &str = "mem://";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// Helper functions for creating common errors

impl ConfigError {
    /// Create an Invalid error
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ledger: BackendConfig,
    pub store: BackendConfig,
    pub policy: PolicyConfig,
    pub reconciler: ReconcilerSettings,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Where a backing service lives and how many connections it may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
    pub max_connections: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: IN_MEMORY_ENDPOINT.to_string(),
            max_connections: 4 * num_cpus::get(),
        }
    }
}

impl BackendConfig {
    pub fn is_in_memory(&self) -> bool {
        self.endpoint == IN_MEMORY_ENDPOINT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub restaurant_discount: Decimal,
    pub grocery_discount: Decimal,
    pub min_purchase: Decimal,
    pub min_post_payment_balance: Decimal,
    pub daily_limit: Decimal,
    pub monthly_limit: Decimal,
    pub signup_bonus: Decimal,
    pub referrer_bonus: Decimal,
    pub referee_bonus: Decimal,
    pub restaurant_open_hour: u32,
    pub restaurant_close_hour: u32,
    /// Account-local time zone, in minutes east of UTC
    pub utc_offset_minutes: i32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let policy = Policy::default();
        Self {
            restaurant_discount: policy.restaurant_discount,
            grocery_discount: policy.grocery_discount,
            min_purchase: policy.min_purchase.to_decimal(),
            min_post_payment_balance: policy.min_post_payment_balance.to_decimal(),
            daily_limit: policy.daily_limit.to_decimal(),
            monthly_limit: policy.monthly_limit.to_decimal(),
            signup_bonus: policy.signup_bonus.to_decimal(),
            referrer_bonus: policy.referrer_bonus.to_decimal(),
            referee_bonus: policy.referee_bonus.to_decimal(),
            restaurant_open_hour: policy.restaurant_open_hour,
            restaurant_close_hour: policy.restaurant_close_hour,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub interval_secs: u64,
    pub pending_threshold_secs: u64,
    pub grace_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            pending_threshold_secs: 30,
            grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub subscriber_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Profiles loaded into the in-process directory at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub users: Vec<UserEntry>,
    pub merchants: Vec<MerchantEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantEntry {
    pub id: MerchantId,
    pub name: String,
    pub category: String,
}

fn coins(field: &str, value: Decimal) -> Result<Coins, ConfigError> {
    if value.scale() > 2 && value.normalize().scale() > 2 {
        return Err(ConfigError::invalid(format!(
            "policy.{} has more than two decimal places: {}",
            field, value
        )));
    }
    Coins::from_decimal(value)
        .ok_or_else(|| ConfigError::invalid(format!("policy.{} is out of range: {}", field, value)))
}

impl Config {
    /// Read, parse and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// * `Io` - the file is missing or unreadable
    /// * `Parse` - the file is not valid YAML for this schema
    /// * `Invalid` - a value is out of bounds
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating. Blank input yields the defaults.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        for (field, rate) in [
            ("restaurant_discount", p.restaurant_discount),
            ("grocery_discount", p.grocery_discount),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(ConfigError::invalid(format!(
                    "policy.{} must be in [0, 1), got {}",
                    field, rate
                )));
            }
        }
        for (field, value) in [
            ("min_purchase", p.min_purchase),
            ("daily_limit", p.daily_limit),
            ("monthly_limit", p.monthly_limit),
        ] {
            if value <= Decimal::ZERO {
                return Err(ConfigError::invalid(format!(
                    "policy.{} must be positive, got {}",
                    field, value
                )));
            }
        }
        for (field, value) in [
            ("min_post_payment_balance", p.min_post_payment_balance),
            ("signup_bonus", p.signup_bonus),
            ("referrer_bonus", p.referrer_bonus),
            ("referee_bonus", p.referee_bonus),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::invalid(format!(
                    "policy.{} must not be negative, got {}",
                    field, value
                )));
            }
        }
        if p.restaurant_open_hour > p.restaurant_close_hour || p.restaurant_close_hour > 23 {
            return Err(ConfigError::invalid(format!(
                "restaurant hours {}..={} are not a valid range of hours",
                p.restaurant_open_hour, p.restaurant_close_hour
            )));
        }
        if !(-14 * 60..=14 * 60).contains(&p.utc_offset_minutes) {
            return Err(ConfigError::invalid(format!(
                "policy.utc_offset_minutes {} is outside +/-14h",
                p.utc_offset_minutes
            )));
        }
        if self.ledger.max_connections == 0 || self.store.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections must be at least 1"));
        }
        if self.reconciler.interval_secs == 0 {
            return Err(ConfigError::invalid("reconciler.interval_secs must be at least 1"));
        }
        if self.events.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("events.subscriber_buffer must be at least 1"));
        }
        self.policy().map(|_| ())
    }

    /// The policy constants in engine units.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        let p = &self.policy;
        let utc_offset = FixedOffset::east_opt(p.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::invalid(format!("invalid utc offset {} minutes", p.utc_offset_minutes))
        })?;
        Ok(Policy {
            restaurant_discount: p.restaurant_discount,
            grocery_discount: p.grocery_discount,
            min_purchase: coins("min_purchase", p.min_purchase)?,
            min_post_payment_balance: coins("min_post_payment_balance", p.min_post_payment_balance)?,
            daily_limit: coins("daily_limit", p.daily_limit)?,
            monthly_limit: coins("monthly_limit", p.monthly_limit)?,
            signup_bonus: coins("signup_bonus", p.signup_bonus)?,
            referrer_bonus: coins("referrer_bonus", p.referrer_bonus)?,
            referee_bonus: coins("referee_bonus", p.referee_bonus)?,
            restaurant_open_hour: p.restaurant_open_hour,
            restaurant_close_hour: p.restaurant_close_hour,
            utc_offset,
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        let r = &self.reconciler;
        ReconcilerConfig {
            interval: std::time::Duration::from_secs(r.interval_secs),
            threshold: chrono::Duration::seconds(r.pending_threshold_secs as i64),
            grace: chrono::Duration::seconds(r.grace_secs as i64),
        }
    }
}
