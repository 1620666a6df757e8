//! Configuration loading from JSON (or TOML) with environment overrides.
//!
//! Reads the file named on the command line and deserializes it into a
//! strongly-typed struct. Credentials may be supplied or overridden through
//! `LOAN_CYCLE_API_KEY` / `LOAN_CYCLE_API_SECRET`, which `.env` can populate.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::retry::RetryPolicy;
use crate::exchange::binance::DEFAULT_BASE_URL;
use crate::types::LoanCycleError;

pub const API_KEY_ENV: &str = "LOAN_CYCLE_API_KEY";
pub const API_SECRET_ENV: &str = "LOAN_CYCLE_API_SECRET";

const DEFAULT_ASSET: &str = "BNB";
/// 0.0125 % per hour.
const DEFAULT_HOURLY_RATE: Decimal = dec!(0.000125);
const DEFAULT_LOAN_HOURS: u32 = 2;
const DEFAULT_LOAN_TIME_UTC: &str = "23:45";
const DEFAULT_WINDOW_MINUTES: u32 = 20;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 2000;

/// Top-level application configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "empty_secret")]
    pub api_secret: SecretString,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub loan_amount: Option<Decimal>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_asset")]
    pub asset: String,
    #[serde(default = "default_hourly_rate", deserialize_with = "de_decimal")]
    pub hourly_rate: Decimal,
    #[serde(default = "default_loan_hours")]
    pub loan_hours: u32,
    #[serde(default = "default_loan_time")]
    pub loan_time_utc: String,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub recv_window_ms: Option<u64>,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}
fn default_asset() -> String {
    DEFAULT_ASSET.to_string()
}
fn default_hourly_rate() -> Decimal {
    DEFAULT_HOURLY_RATE
}
fn default_loan_hours() -> u32 {
    DEFAULT_LOAN_HOURS
}
fn default_loan_time() -> String {
    DEFAULT_LOAN_TIME_UTC.to_string()
}
fn default_window_minutes() -> u32 {
    DEFAULT_WINDOW_MINUTES
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Decimal written either as a JSON/TOML number or as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDecimal {
    Text(String),
    Int(i64),
    Float(f64),
}

impl RawDecimal {
    fn into_decimal(self) -> Result<Decimal, String> {
        match self {
            RawDecimal::Text(s) => Decimal::from_str(s.trim()).map_err(|e| format!("{s:?}: {e}")),
            RawDecimal::Int(i) => Ok(Decimal::from(i)),
            // f64 Display yields the shortest round-trip form, so 0.1 stays 0.1.
            RawDecimal::Float(f) => {
                Decimal::from_str(&f.to_string()).map_err(|e| format!("{f}: {e}"))
            }
        }
    }
}

fn de_decimal<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Decimal, D::Error> {
    RawDecimal::deserialize(d)?
        .into_decimal()
        .map_err(serde::de::Error::custom)
}

fn de_opt_decimal<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Decimal>, D::Error> {
    Option::<RawDecimal>::deserialize(d)?
        .map(|raw| raw.into_decimal().map_err(serde::de::Error::custom))
        .transpose()
}

impl AppConfig {
    /// Load, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&contents, is_toml(path))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config text without touching the environment.
    pub fn parse(contents: &str, toml_format: bool) -> Result<Self> {
        let config = if toml_format {
            toml::from_str(contents)?
        } else {
            serde_json::from_str(contents)?
        };
        Ok(config)
    }

    /// Credentials from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.api_key = key;
            }
        }
        if let Ok(secret) = std::env::var(API_SECRET_ENV) {
            if !secret.is_empty() {
                self.api_secret = SecretString::new(secret);
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), LoanCycleError> {
        let fail = |msg: String| Err(LoanCycleError::Config(msg));

        if self.api_key.trim().is_empty() {
            return fail(format!("apiKey is missing (set it in the file or {API_KEY_ENV})"));
        }
        if self.api_secret.expose_secret().trim().is_empty() {
            return fail(format!("apiSecret is missing (set it in the file or {API_SECRET_ENV})"));
        }
        if self.asset.trim().is_empty() {
            return fail("asset must not be empty".into());
        }
        if !self.test_mode {
            match self.loan_amount {
                None => return fail("loanAmount is required unless testMode is set".into()),
                Some(a) if a <= Decimal::ZERO => {
                    return fail(format!("loanAmount must be positive, got {a}"))
                }
                Some(_) => {}
            }
        }
        if self.hourly_rate < Decimal::ZERO {
            return fail(format!("hourlyRate must not be negative, got {}", self.hourly_rate));
        }
        if self.window_minutes == 0 {
            return fail("windowMinutes must be at least 1".into());
        }
        if self.max_attempts == 0 {
            return fail("maxAttempts must be at least 1".into());
        }
        self.loan_time()?;
        Ok(())
    }

    /// Parsed `loanTimeUtc`.
    pub fn loan_time(&self) -> std::result::Result<NaiveTime, LoanCycleError> {
        NaiveTime::parse_from_str(&self.loan_time_utc, "%H:%M").map_err(|e| {
            LoanCycleError::Config(format!(
                "loanTimeUtc {:?} is not HH:MM: {e}",
                self.loan_time_utc
            ))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}
