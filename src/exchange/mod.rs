//! Exchange integrations.
//!
//! Defines the `MarginExchange` trait, the signed-client capability the loan
//! cycle runs against, and provides the Binance margin implementation.

pub mod binance;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{ExchangeFailure, MarginAccount, StepResult, TransferDirection};

/// Authenticated margin operations on one exchange account.
///
/// Mutating calls never return `Err`: every exchange-side or transport
/// problem is folded into `StepResult::Failure` so the retry executor can
/// decide what to do with it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarginExchange: Send + Sync {
    /// Fetch margin account balances.
    async fn margin_account(&self) -> Result<MarginAccount, ExchangeFailure>;

    /// Borrow `amount` of `asset` into the margin account.
    async fn loan(&self, asset: &str, amount: Decimal) -> StepResult;

    /// Repay `amount` of `asset` (principal plus interest).
    async fn repay(&self, asset: &str, amount: Decimal) -> StepResult;

    /// Move `amount` of `asset` between the trading and margin accounts.
    async fn transfer(
        &self,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> StepResult;
}
