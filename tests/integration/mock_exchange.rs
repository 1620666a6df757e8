//! Scripted exchange for integration testing.
//!
//! Provides a deterministic `MarginExchange` implementation whose responses
//! are queued up front by the test. Every call is logged with the tokio
//! instant it arrived at, so tests can assert on ordering and spacing.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use loan_cycle::exchange::MarginExchange;
use loan_cycle::types::{
    ExchangeFailure, MarginAccount, MarginAsset, StepResult, TransferDirection,
};

/// One recorded exchange call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Account,
    Loan(Decimal),
    TransferOut(Decimal),
    TransferBack(Decimal),
    Repay(Decimal),
}

impl Call {
    /// Loan, transfer and repay calls move funds; the account query does not.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Call::Account)
    }
}

#[derive(Default)]
struct Script {
    loan: VecDeque<StepResult>,
    transfer_out: VecDeque<StepResult>,
    transfer_back: VecDeque<StepResult>,
    repay: VecDeque<StepResult>,
}

/// In-memory exchange. Unscripted calls succeed with a generated id.
pub struct ScriptedExchange {
    asset: String,
    balance: Decimal,
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<(Call, Instant)>>>,
}

impl ScriptedExchange {
    pub fn new(asset: &str, balance: Decimal) -> Self {
        Self {
            asset: asset.to_string(),
            balance,
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script_loan(self, results: impl IntoIterator<Item = StepResult>) -> Self {
        self.script.lock().unwrap().loan.extend(results);
        self
    }

    pub fn script_transfer_out(self, results: impl IntoIterator<Item = StepResult>) -> Self {
        self.script.lock().unwrap().transfer_out.extend(results);
        self
    }

    pub fn script_transfer_back(self, results: impl IntoIterator<Item = StepResult>) -> Self {
        self.script.lock().unwrap().transfer_back.extend(results);
        self
    }

    pub fn script_repay(self, results: impl IntoIterator<Item = StepResult>) -> Self {
        self.script.lock().unwrap().repay.extend(results);
        self
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Gaps between consecutive calls matching `pred`.
    pub fn gaps_between(&self, pred: impl Fn(&Call) -> bool) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        let times: Vec<Instant> = calls
            .iter()
            .filter(|(c, _)| pred(c))
            .map(|(_, at)| *at)
            .collect();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.is_mutating()).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((call, Instant::now()));
    }

    fn next(
        &self,
        pick: impl FnOnce(&mut Script) -> &mut VecDeque<StepResult>,
        fallback: &str,
    ) -> StepResult {
        let mut script = self.script.lock().unwrap();
        pick(&mut *script)
            .pop_front()
            .unwrap_or_else(|| StepResult::success(format!("{fallback}-auto")))
    }
}

#[async_trait]
impl MarginExchange for ScriptedExchange {
    async fn margin_account(&self) -> Result<MarginAccount, ExchangeFailure> {
        self.record(Call::Account);
        Ok(MarginAccount {
            user_assets: vec![MarginAsset {
                asset: self.asset.clone(),
                free: self.balance,
                borrowed: Decimal::ZERO,
                interest: Decimal::ZERO,
            }],
        })
    }

    async fn loan(&self, _asset: &str, amount: Decimal) -> StepResult {
        self.record(Call::Loan(amount));
        self.next(|s| &mut s.loan, "loan")
    }

    async fn repay(&self, _asset: &str, amount: Decimal) -> StepResult {
        self.record(Call::Repay(amount));
        self.next(|s| &mut s.repay, "repay")
    }

    async fn transfer(
        &self,
        _asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> StepResult {
        match direction {
            TransferDirection::ToTrading => {
                self.record(Call::TransferOut(amount));
                self.next(|s| &mut s.transfer_out, "transfer-out")
            }
            TransferDirection::ToMargin => {
                self.record(Call::TransferBack(amount));
                self.next(|s| &mut s.transfer_back, "transfer-back")
            }
        }
    }
}
