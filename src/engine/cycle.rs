//! Loan-cycle state machine.
//!
//! Drives one cycle strictly in order:
//!
//! ```text
//! Idle → AwaitingLoanTime → Loaning → AwaitingTransferOut → TransferringOut
//!      → AwaitingRepayTime → TransferringBack → Repaying → Completed
//! ```
//!
//! Any step that exhausts its retries moves the cycle to `Failed` with a
//! step-specific reason. Steps already committed at the exchange are not
//! unwound; they are logged for manual reconciliation.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::retry::{execute_with_retry, RetryPolicy};
use crate::engine::scheduler::{Cancelled, Scheduler};
use crate::exchange::MarginExchange;
use crate::plan::LoanPlan;
use crate::types::{
    CycleOutcome, CyclePhase, CycleState, FailureReason, Step, StepResult, StepStatus,
    TransferDirection,
};

/// Why `drive` stopped early.
enum Halt {
    Failed(FailureReason),
    Cancelled,
}

impl From<Cancelled> for Halt {
    fn from(_: Cancelled) -> Self {
        Halt::Cancelled
    }
}

pub struct LoanCycle {
    exchange: Arc<dyn MarginExchange>,
    scheduler: Scheduler,
    policy: RetryPolicy,
    plan: LoanPlan,
    state: CycleState,
}

impl LoanCycle {
    pub fn new(
        exchange: Arc<dyn MarginExchange>,
        scheduler: Scheduler,
        policy: RetryPolicy,
        plan: LoanPlan,
    ) -> Self {
        Self {
            exchange,
            scheduler,
            policy,
            plan,
            state: CycleState::new(),
        }
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    /// Run the cycle to a terminal phase.
    pub async fn run(&mut self) -> CycleOutcome {
        if self.state.phase.is_terminal() {
            warn!(phase = %self.state.phase, "Cycle already finished");
            return self.outcome();
        }

        match self.drive().await {
            Ok(()) => {
                self.transition(CyclePhase::Completed);
                info!(
                    tran_ids = ?self.state.transaction_ids(),
                    "Loan cycle completed"
                );
            }
            Err(Halt::Failed(reason)) => {
                self.transition(CyclePhase::Failed(reason));
                self.report_failure(reason);
            }
            Err(Halt::Cancelled) => {
                self.transition(CyclePhase::Cancelled);
                let committed = self.state.committed_steps();
                if committed.is_empty() {
                    info!("Loan cycle cancelled before any funds moved");
                } else {
                    warn!(
                        committed = ?committed,
                        tran_ids = ?self.state.transaction_ids(),
                        "Loan cycle cancelled with committed steps; reconcile manually"
                    );
                }
            }
        }
        self.outcome()
    }

    fn outcome(&self) -> CycleOutcome {
        match self.state.phase {
            CyclePhase::Failed(reason) => CycleOutcome::Failed(reason),
            CyclePhase::Cancelled => CycleOutcome::Cancelled,
            _ => CycleOutcome::Completed,
        }
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        self.preflight().await?;

        self.scheduler.wait_until(self.plan.loan_at).await?;
        self.transition(CyclePhase::Loaning);
        self.run_step(Step::Loan).await?;

        // Transfer out follows the loan with no further wait.
        self.transition(CyclePhase::AwaitingTransferOut);
        self.transition(CyclePhase::TransferringOut);
        self.run_step(Step::TransferOut).await?;

        self.transition(CyclePhase::AwaitingRepayTime);
        info!(repay_at = %self.plan.repay_at.to_rfc3339(), "Waiting to repay loan");
        self.scheduler.wait_until(self.plan.repay_at).await?;

        self.transition(CyclePhase::TransferringBack);
        self.run_step(Step::TransferBack).await?;

        self.transition(CyclePhase::Repaying);
        self.run_step(Step::Repay).await?;
        Ok(())
    }

    /// Solvency check: the free margin balance must cover the interest.
    ///
    /// Issues no loan, transfer or repay call on failure.
    async fn preflight(&mut self) -> Result<(), Halt> {
        info!(plan = %self.plan, "Loan plan");

        let account = match self.exchange.margin_account().await {
            Ok(account) => account,
            Err(e) => {
                error!(error = %e, "Could not fetch margin account");
                return Err(Halt::Failed(FailureReason::AccountUnavailable));
            }
        };

        let balance = account.free_balance(&self.plan.asset);
        info!(
            asset = %self.plan.asset,
            balance = %balance,
            interest = %self.plan.interest,
            "Margin balance"
        );

        if !self.plan.covers_interest(balance) {
            error!(
                asset = %self.plan.asset,
                balance = %balance,
                interest = %self.plan.interest,
                "Balance not sufficient to repay interest"
            );
            return Err(Halt::Failed(FailureReason::InsufficientBalance));
        }

        self.transition(CyclePhase::AwaitingLoanTime);
        info!(
            loan_at = %self.plan.loan_at.to_rfc3339(),
            repay_at = %self.plan.repay_at.to_rfc3339(),
            "Cycle scheduled"
        );
        Ok(())
    }

    async fn run_step(&mut self, step: Step) -> Result<(), Halt> {
        if self.state.step(step).status == StepStatus::Succeeded {
            warn!(step = %step, "Step already succeeded; not re-entering");
            return Ok(());
        }
        self.state.step_mut(step).status = StepStatus::InFlight;

        let outcome = {
            let this = &*self;
            execute_with_retry(step.label(), &this.policy, || this.call(step)).await
        };

        let record = self.state.step_mut(step);
        record.attempts += outcome.attempts;
        match outcome.result {
            StepResult::Success { transaction_id } => {
                record.status = StepStatus::Succeeded;
                record.retries = 0;
                record.last_error = None;
                record.transaction_id = Some(transaction_id);
                Ok(())
            }
            StepResult::Failure(failure) => {
                record.status = StepStatus::Failed;
                record.retries = outcome.attempts.saturating_sub(1);
                error!(
                    step = %step,
                    attempts = outcome.attempts,
                    code = failure.code.as_deref().unwrap_or("-"),
                    message = %failure.message,
                    "Step failed after exhausting retries"
                );
                record.last_error = Some(failure);
                Err(Halt::Failed(step.failure_reason()))
            }
        }
    }

    /// One exchange invocation for `step`, with the plan's fixed parameters.
    async fn call(&self, step: Step) -> StepResult {
        let asset = self.plan.asset.as_str();
        match step {
            Step::Loan => {
                info!(amount = %self.plan.loan_amount, asset, "Loaning");
                self.exchange.loan(asset, self.plan.loan_amount).await
            }
            Step::TransferOut => {
                info!(amount = %self.plan.loan_amount, asset, "Transferring to trading account");
                self.exchange
                    .transfer(asset, self.plan.loan_amount, TransferDirection::ToTrading)
                    .await
            }
            Step::TransferBack => {
                info!(amount = %self.plan.loan_amount, asset, "Transferring back to margin account");
                self.exchange
                    .transfer(asset, self.plan.loan_amount, TransferDirection::ToMargin)
                    .await
            }
            Step::Repay => {
                info!(amount = %self.plan.repay_amount, asset, "Repaying loan");
                self.exchange.repay(asset, self.plan.repay_amount).await
            }
        }
    }

    fn transition(&mut self, to: CyclePhase) {
        let from = self.state.phase;
        info!(from = %from, to = %to, "Phase transition");
        self.state.phase = to;
        self.state.history.push(to);
    }

    fn report_failure(&self, reason: FailureReason) {
        let committed = self.state.committed_steps();
        error!(reason = ?reason, "Loan cycle failed: {reason}");
        if !committed.is_empty() {
            error!(
                committed = ?committed,
                tran_ids = ?self.state.transaction_ids(),
                loan_amount = %self.plan.loan_amount,
                repay_amount = %self.plan.repay_amount,
                asset = %self.plan.asset,
                "Completed steps were not unwound; reconcile manually"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
