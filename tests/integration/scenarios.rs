//! End-to-end loan cycles.
//!
//! Each test runs a whole cycle on a paused tokio runtime: the scheduler's
//! waits and the retry backoffs advance virtual time only.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use loan_cycle::config::AppConfig;
use loan_cycle::engine::cycle::LoanCycle;
use loan_cycle::engine::retry::RetryPolicy;
use loan_cycle::engine::scheduler::{shutdown_channel, AnchoredClock, Scheduler, ShutdownHandle};
use loan_cycle::plan::LoanPlan;
use loan_cycle::types::{
    CycleOutcome, CyclePhase, ExchangeFailure, FailureReason, Step, StepResult, StepStatus,
};

use crate::mock_exchange::{Call, ScriptedExchange};

fn scheduler(anchor: DateTime<Utc>) -> (Scheduler, ShutdownHandle) {
    let (handle, rx) = shutdown_channel();
    (Scheduler::new(Arc::new(AnchoredClock::new(anchor)), rx), handle)
}

fn rate_limited() -> StepResult {
    StepResult::Failure(
        ExchangeFailure::api(429, Some("-1003".into()), "Too many requests")
            .with_retry_after(Duration::from_secs(1)),
    )
}

fn rejected() -> StepResult {
    StepResult::Failure(ExchangeFailure::api(
        400,
        Some("-3041".into()),
        "Balance is not enough",
    ))
}

fn test_mode_plan(anchor: DateTime<Utc>) -> LoanPlan {
    let cfg = AppConfig::parse(r#"{"loanAmount": 10, "testMode": true}"#, false).unwrap();
    LoanPlan::from_config(&cfg, anchor).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_completes_with_all_ids() {
    let anchor = Utc::now();
    let plan = test_mode_plan(anchor);
    assert_eq!(plan.loan_amount, dec!(1));

    let exchange = Arc::new(
        ScriptedExchange::new("BNB", dec!(5))
            .script_loan([StepResult::success("L1")])
            .script_transfer_out([StepResult::success("T1")])
            .script_transfer_back([StepResult::success("T2")])
            .script_repay([StepResult::success("R1")]),
    );
    let (scheduler, _handle) = scheduler(anchor);
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, RetryPolicy::default(), plan);

    let outcome = cycle.run().await;

    assert_eq!(outcome, CycleOutcome::Completed);
    assert_eq!(outcome.exit_code(), 0);
    let state = cycle.state();
    assert_eq!(state.phase, CyclePhase::Completed);
    assert_eq!(
        state.transaction_ids(),
        vec![
            (Step::Loan, "L1"),
            (Step::TransferOut, "T1"),
            (Step::TransferBack, "T2"),
            (Step::Repay, "R1"),
        ]
    );
    assert_eq!(
        exchange.calls(),
        vec![
            Call::Account,
            Call::Loan(dec!(1)),
            Call::TransferOut(dec!(1)),
            Call::TransferBack(dec!(1)),
            Call::Repay(dec!(1.000125)),
        ]
    );
    assert_eq!(
        state.history,
        vec![
            CyclePhase::Idle,
            CyclePhase::AwaitingLoanTime,
            CyclePhase::Loaning,
            CyclePhase::AwaitingTransferOut,
            CyclePhase::TransferringOut,
            CyclePhase::AwaitingRepayTime,
            CyclePhase::TransferringBack,
            CyclePhase::Repaying,
            CyclePhase::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_loan_honours_retry_after_then_proceeds() {
    let anchor = Utc::now();
    let plan = test_mode_plan(anchor);
    let exchange = Arc::new(
        ScriptedExchange::new("BNB", dec!(5))
            .script_loan([rate_limited(), rate_limited(), StepResult::success("L1")]),
    );
    let (scheduler, _handle) = scheduler(anchor);
    // Backoff shorter than the hint so the hint decides the wait.
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(100),
    };
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, policy, plan);

    let outcome = cycle.run().await;

    let loan_gaps = exchange.gaps_between(|c| matches!(c, Call::Loan(_)));
    assert_eq!(loan_gaps.len(), 2);
    assert!(loan_gaps.iter().all(|gap| *gap >= Duration::from_millis(1000)));

    let state = cycle.state();
    assert_eq!(state.loan.attempts, 3);
    assert_eq!(state.loan.retries, 0);
    assert_eq!(state.loan.transaction_id.as_deref(), Some("L1"));
    assert!(state.history.contains(&CyclePhase::AwaitingTransferOut));
    assert_eq!(outcome, CycleOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_back_exhausted_skips_repay() {
    let anchor = Utc::now();
    let plan = test_mode_plan(anchor);
    let exchange = Arc::new(
        ScriptedExchange::new("BNB", dec!(5))
            .script_transfer_back([rejected(), rejected(), rejected()]),
    );
    let (scheduler, _handle) = scheduler(anchor);
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, RetryPolicy::default(), plan);

    let outcome = cycle.run().await;

    assert_eq!(outcome, CycleOutcome::Failed(FailureReason::TransferBackFailed));
    assert_eq!(outcome.exit_code(), 6);
    assert_eq!(
        cycle.state().phase,
        CyclePhase::Failed(FailureReason::TransferBackFailed)
    );

    let calls = exchange.calls();
    assert_eq!(
        calls.iter().filter(|c| matches!(c, Call::TransferBack(_))).count(),
        3
    );
    assert!(!calls.iter().any(|c| matches!(c, Call::Repay(_))));

    let record = &cycle.state().transfer_back;
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.retries, 2);
    assert_eq!(
        record.last_error.as_ref().and_then(|e| e.code.as_deref()),
        Some("-3041")
    );
    assert_eq!(
        cycle.state().committed_steps(),
        vec![Step::Loan, Step::TransferOut]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repay_exhausted_leaves_loan_open() {
    let anchor = Utc::now();
    let plan = test_mode_plan(anchor);
    let exchange = Arc::new(
        ScriptedExchange::new("BNB", dec!(5))
            .script_repay([rejected(), rejected(), rejected()]),
    );
    let (scheduler, _handle) = scheduler(anchor);
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, RetryPolicy::default(), plan);

    let outcome = cycle.run().await;

    assert_eq!(outcome, CycleOutcome::Failed(FailureReason::RepayFailed));
    assert_eq!(outcome.exit_code(), 7);
    assert_eq!(
        exchange
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Repay(_)))
            .count(),
        3
    );
    assert_eq!(cycle.state().repay.status, StepStatus::Failed);
    assert_eq!(
        cycle.state().committed_steps(),
        vec![Step::Loan, Step::TransferOut, Step::TransferBack]
    );
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_balance_moves_no_funds() {
    let anchor = Utc::now();
    let plan = LoanPlan::new(
        "BNB",
        dec!(16),
        anchor + ChronoDuration::seconds(10),
        anchor + ChronoDuration::seconds(60),
        dec!(0.000125),
        1,
    )
    .unwrap();
    assert_eq!(plan.interest, dec!(0.002));

    let exchange = Arc::new(ScriptedExchange::new("BNB", dec!(0.001)));
    let (scheduler, _handle) = scheduler(anchor);
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, RetryPolicy::default(), plan);

    let started = tokio::time::Instant::now();
    let outcome = cycle.run().await;

    assert_eq!(outcome, CycleOutcome::Failed(FailureReason::InsufficientBalance));
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(exchange.mutating_calls(), 0);
    // Fails before waiting for the loan time.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_repay_wait_leaves_loan_open() {
    let anchor = Utc::now();
    let plan = test_mode_plan(anchor);
    let exchange = Arc::new(ScriptedExchange::new("BNB", dec!(5)));
    let (scheduler, handle) = scheduler(anchor);
    let mut cycle = LoanCycle::new(exchange.clone(), scheduler, RetryPolicy::default(), plan);

    let cancel = async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.shutdown();
    };
    let (outcome, ()) = tokio::join!(cycle.run(), cancel);

    assert_eq!(outcome, CycleOutcome::Cancelled);
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(
        exchange.calls(),
        vec![
            Call::Account,
            Call::Loan(Decimal::ONE),
            Call::TransferOut(Decimal::ONE),
        ]
    );
    assert_eq!(
        cycle.state().committed_steps(),
        vec![Step::Loan, Step::TransferOut]
    );
}
