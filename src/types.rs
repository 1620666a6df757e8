//! Shared types for the loan cycle.
//!
//! These types form the data model used across all modules: the result of
//! a single exchange call, the per-step bookkeeping owned by the state
//! machine, and the terminal outcomes reported to the operator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Exchange call results
// ---------------------------------------------------------------------------

/// A failed exchange call.
///
/// Carries the exchange's own error code and message verbatim so they can
/// be logged without reinterpretation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct ExchangeFailure {
    /// HTTP status, if a response was received at all.
    pub http_status: Option<u16>,
    /// Exchange-provided error code (e.g. `-3041`).
    pub code: Option<String>,
    pub message: String,
    /// `Retry-After` hint from a rate-limit response.
    pub retry_after: Option<Duration>,
}

impl ExchangeFailure {
    /// A failure that never reached the exchange (DNS, TLS, timeout, ...).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A non-success response from the exchange.
    pub fn api(http_status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(http_status),
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// HTTP 429 / 418: the exchange is asking us to back off.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.http_status, Some(429) | Some(418))
    }

    /// `HTTP 400 code -3041: message`, or `transport error: message`.
    fn describe(&self) -> String {
        let mut out = match self.http_status {
            Some(status) => format!("HTTP {status}"),
            None => "transport error".to_string(),
        };
        if let Some(ref code) = self.code {
            out.push_str(&format!(" code {code}"));
        }
        if !self.message.is_empty() {
            out.push_str(&format!(": {}", self.message));
        }
        out
    }
}

/// Outcome of one signed exchange call (loan, repay or transfer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success { transaction_id: String },
    Failure(ExchangeFailure),
}

impl StepResult {
    pub fn success(transaction_id: impl Into<String>) -> Self {
        StepResult::Success {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            StepResult::Success { transaction_id } => Some(transaction_id),
            StepResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ExchangeFailure> {
        match self {
            StepResult::Success { .. } => None,
            StepResult::Failure(f) => Some(f),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.failure().and_then(|f| f.code.as_deref())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.failure().and_then(|f| f.retry_after)
    }
}

// ---------------------------------------------------------------------------
// Margin account
// ---------------------------------------------------------------------------

/// Direction of a transfer between the spot (trading) and margin accounts.
///
/// The discriminants are the exchange's `type` parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Trading account → margin account.
    ToMargin = 1,
    /// Margin account → trading account.
    ToTrading = 2,
}

impl TransferDirection {
    pub fn as_param(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::ToMargin => write!(f, "to margin"),
            TransferDirection::ToTrading => write!(f, "to trading"),
        }
    }
}

/// One asset line of the margin account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAsset {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub borrowed: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub interest: Decimal,
}

/// Margin account details as returned by the account query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginAccount {
    #[serde(rename = "userAssets", default)]
    pub user_assets: Vec<MarginAsset>,
}

impl MarginAccount {
    /// Free balance of `asset`; zero when the asset is not listed.
    pub fn free_balance(&self, asset: &str) -> Decimal {
        self.user_assets
            .iter()
            .find(|a| a.asset == asset)
            .map(|a| a.free)
            .unwrap_or(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

/// The four financial steps of a loan cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Loan,
    TransferOut,
    TransferBack,
    Repay,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Loan, Step::TransferOut, Step::TransferBack, Step::Repay];

    pub fn label(self) -> &'static str {
        match self {
            Step::Loan => "loan",
            Step::TransferOut => "transfer_out",
            Step::TransferBack => "transfer_back",
            Step::Repay => "repay",
        }
    }

    /// Terminal reason reported when this step exhausts its retries.
    pub fn failure_reason(self) -> FailureReason {
        match self {
            Step::Loan => FailureReason::LoanFailed,
            Step::TransferOut => FailureReason::TransferOutFailed,
            Step::TransferBack => FailureReason::TransferBackFailed,
            Step::Repay => FailureReason::RepayFailed,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepStatus {
    #[default]
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// Bookkeeping for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Retries consumed by the current attempt run; reset to 0 on success.
    pub retries: u32,
    /// Total invocations issued for this step.
    pub attempts: u32,
    pub transaction_id: Option<String>,
    pub last_error: Option<ExchangeFailure>,
}

/// Why a cycle stopped short of `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum FailureReason {
    #[error("margin balance does not cover the loan interest")]
    InsufficientBalance,
    #[error("margin account details could not be fetched")]
    AccountUnavailable,
    #[error("loan failed")]
    LoanFailed,
    #[error("transfer to trading account failed; loan is outstanding")]
    TransferOutFailed,
    #[error("transfer back to margin account failed; loan is outstanding")]
    TransferBackFailed,
    #[error("repay failed; loan remains open past the window")]
    RepayFailed,
}

impl FailureReason {
    pub fn exit_code(self) -> u8 {
        match self {
            FailureReason::InsufficientBalance => 3,
            FailureReason::LoanFailed => 4,
            FailureReason::TransferOutFailed => 5,
            FailureReason::TransferBackFailed => 6,
            FailureReason::RepayFailed => 7,
            FailureReason::AccountUnavailable => 8,
        }
    }
}

/// State machine phases. `Failed` and `Cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Idle,
    AwaitingLoanTime,
    Loaning,
    AwaitingTransferOut,
    TransferringOut,
    AwaitingRepayTime,
    TransferringBack,
    Repaying,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl CyclePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CyclePhase::Completed | CyclePhase::Failed(_) | CyclePhase::Cancelled
        )
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Failed(reason) => write!(f, "Failed({reason:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Mutable record of one cycle, owned exclusively by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleState {
    pub phase: CyclePhase,
    /// Every phase entered, in order, starting with `Idle`.
    pub history: Vec<CyclePhase>,
    pub loan: StepRecord,
    pub transfer_out: StepRecord,
    pub transfer_back: StepRecord,
    pub repay: StepRecord,
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
            history: vec![CyclePhase::Idle],
            loan: StepRecord::default(),
            transfer_out: StepRecord::default(),
            transfer_back: StepRecord::default(),
            repay: StepRecord::default(),
        }
    }

    pub fn step(&self, step: Step) -> &StepRecord {
        match step {
            Step::Loan => &self.loan,
            Step::TransferOut => &self.transfer_out,
            Step::TransferBack => &self.transfer_back,
            Step::Repay => &self.repay,
        }
    }

    pub fn step_mut(&mut self, step: Step) -> &mut StepRecord {
        match step {
            Step::Loan => &mut self.loan,
            Step::TransferOut => &mut self.transfer_out,
            Step::TransferBack => &mut self.transfer_back,
            Step::Repay => &mut self.repay,
        }
    }

    /// Transaction ids of completed steps, in execution order.
    pub fn transaction_ids(&self) -> Vec<(Step, &str)> {
        Step::ALL
            .iter()
            .filter_map(|&s| self.step(s).transaction_id.as_deref().map(|id| (s, id)))
            .collect()
    }

    /// Steps that committed funds at the exchange.
    pub fn committed_steps(&self) -> Vec<Step> {
        Step::ALL
            .iter()
            .copied()
            .filter(|&s| self.step(s).status == StepStatus::Succeeded)
            .collect()
    }
}

/// Final result of running a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl CycleOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> u8 {
        match self {
            CycleOutcome::Completed => 0,
            CycleOutcome::Failed(reason) => reason.exit_code(),
            CycleOutcome::Cancelled => 130,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised outside the exchange step flow.
#[derive(Debug, thiserror::Error)]
pub enum LoanCycleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
