//! Loan plan: what to borrow, when, and how much to pay back.
//!
//! Computed once at startup from configuration and the current time;
//! immutable afterwards.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;

use crate::config::AppConfig;
use crate::types::LoanCycleError;

/// Delay from startup to the loan in test mode.
const TEST_LOAN_DELAY_SECS: i64 = 10;
/// Delay from startup to the repay in test mode.
const TEST_REPAY_DELAY_SECS: i64 = 60;
const TEST_LOAN_AMOUNT: Decimal = dec!(1);
const TEST_LOAN_HOURS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanPlan {
    pub asset: String,
    pub loan_amount: Decimal,
    pub loan_at: DateTime<Utc>,
    pub repay_at: DateTime<Utc>,
    pub hourly_rate: Decimal,
    pub loan_hours: u32,
    pub interest: Decimal,
    pub repay_amount: Decimal,
}

impl LoanPlan {
    /// Build a plan, deriving interest and repay amount.
    ///
    /// Interest is simple (non-compounding):
    /// `loan_amount × hourly_rate × loan_hours`.
    pub fn new(
        asset: impl Into<String>,
        loan_amount: Decimal,
        loan_at: DateTime<Utc>,
        repay_at: DateTime<Utc>,
        hourly_rate: Decimal,
        loan_hours: u32,
    ) -> Result<Self, LoanCycleError> {
        if repay_at <= loan_at {
            return Err(LoanCycleError::Config(format!(
                "repay time {repay_at} must be after loan time {loan_at}"
            )));
        }
        let interest = loan_amount
            .checked_mul(hourly_rate)
            .and_then(|v| v.checked_mul(Decimal::from(loan_hours)))
            .ok_or_else(|| LoanCycleError::Config("interest overflows".into()))?;
        let repay_amount = loan_amount
            .checked_add(interest)
            .ok_or_else(|| LoanCycleError::Config("repay amount overflows".into()))?;
        Ok(Self {
            asset: asset.into(),
            loan_amount,
            loan_at,
            repay_at,
            hourly_rate,
            loan_hours,
            interest,
            repay_amount,
        })
    }

    /// Derive the plan from configuration relative to `now`.
    ///
    /// Live mode borrows at `loanTimeUtc` on the current UTC date (even if
    /// that instant has already passed, in which case the loan fires
    /// immediately) and repays `windowMinutes` later. Test mode compresses
    /// the window to start in 10 s and end in 60 s with a fixed amount of 1.
    pub fn from_config(cfg: &AppConfig, now: DateTime<Utc>) -> Result<Self, LoanCycleError> {
        if cfg.test_mode {
            return Self::new(
                cfg.asset.clone(),
                TEST_LOAN_AMOUNT,
                now + Duration::seconds(TEST_LOAN_DELAY_SECS),
                now + Duration::seconds(TEST_REPAY_DELAY_SECS),
                cfg.hourly_rate,
                TEST_LOAN_HOURS,
            );
        }

        let loan_amount = cfg
            .loan_amount
            .ok_or_else(|| LoanCycleError::Config("loanAmount is required".into()))?;
        let loan_at = loan_instant(now, cfg.loan_time()?);
        let repay_at = loan_at + Duration::minutes(i64::from(cfg.window_minutes));

        Self::new(
            cfg.asset.clone(),
            loan_amount,
            loan_at,
            repay_at,
            cfg.hourly_rate,
            cfg.loan_hours,
        )
    }

    /// Whether `balance` covers the interest owed.
    pub fn covers_interest(&self, balance: Decimal) -> bool {
        balance >= self.interest
    }
}

impl fmt::Display for LoanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "borrow {} {} at {} | repay {} at {} | interest {} ({} h @ {}/h)",
            self.loan_amount,
            self.asset,
            self.loan_at.to_rfc3339(),
            self.repay_amount,
            self.repay_at.to_rfc3339(),
            self.interest,
            self.loan_hours,
            self.hourly_rate,
        )
    }
}

/// `time` on the UTC date of `now`.
fn loan_instant(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    now.date_naive().and_time(time).and_utc()
}
