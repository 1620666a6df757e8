//! LOAN-CYCLE: scheduled margin loan runner.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! computes the loan plan, and drives one loan cycle to completion with
//! graceful Ctrl-C handling. The exit code reports how the cycle ended.

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use loan_cycle::config::AppConfig;
use loan_cycle::engine::cycle::LoanCycle;
use loan_cycle::engine::scheduler::{shutdown_channel, Scheduler, SystemClock};
use loan_cycle::exchange::binance::BinanceMarginClient;
use loan_cycle::plan::LoanPlan;
use loan_cycle::types::CycleOutcome;

const BANNER: &str = r#"
  +--------------------------------------+
  |  LOAN-CYCLE v0.1.0                   |
  |  Scheduled margin loan runner        |
  +--------------------------------------+
"#;

const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
/// Exit code when a second Ctrl-C forces an exit mid-step.
const EXIT_FORCED: i32 = 130;

#[derive(Parser)]
#[command(name = "loan-cycle", version, about = "Borrow, transfer and repay a margin loan at scheduled times")]
struct Cli {
    /// Path to the config file (JSON, or TOML with a .toml extension).
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();
    println!("{BANNER}");

    let cfg = match AppConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = format!("{e:#}"), "Configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let plan = match LoanPlan::from_config(&cfg, Utc::now()) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "Configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if cfg.test_mode {
        warn!("Test mode: loan window compressed to about one minute, amount fixed at 1");
    }
    info!(
        config = %cli.config.display(),
        asset = %plan.asset,
        loan_amount = %plan.loan_amount,
        repay_amount = %plan.repay_amount,
        interest = %plan.interest,
        loan_at = %plan.loan_at.to_rfc3339(),
        repay_at = %plan.repay_at.to_rfc3339(),
        "LOAN-CYCLE starting up"
    );

    match run(&cfg, plan).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!(error = format!("{e:#}"), "Loan cycle aborted");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// Build the collaborators and run one cycle.
async fn run(cfg: &AppConfig, plan: LoanPlan) -> Result<CycleOutcome> {
    let exchange = Arc::new(BinanceMarginClient::from_config(cfg)?);

    let (shutdown, shutdown_rx) = shutdown_channel();
    let scheduler = Scheduler::new(Arc::new(SystemClock), shutdown_rx)
        .with_countdown(std::io::stdout().is_terminal());

    // First Ctrl-C cancels pending waits; a second one during an in-flight
    // step exits immediately.
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Shutdown signal received. Cancelling pending timers.");
        shutdown.shutdown();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second shutdown signal received. Exiting without waiting for the current step.");
            std::process::exit(EXIT_FORCED);
        }
    });

    let mut cycle = LoanCycle::new(exchange, scheduler, cfg.retry_policy(), plan);
    let cycle_id = Uuid::new_v4();
    let outcome = cycle
        .run()
        .instrument(info_span!("cycle", cycle_id = %cycle_id))
        .await;
    signals.abort();

    let state = cycle.state();
    info!(
        cycle_id = %cycle_id,
        phase = %state.phase,
        tran_ids = ?state.transaction_ids(),
        exit_code = outcome.exit_code(),
        "LOAN-CYCLE finished"
    );
    Ok(outcome)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("loan_cycle=info"));

    let json_logging = std::env::var("LOAN_CYCLE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
