//! Core engine: retry executor, scheduler, and the loan-cycle state machine.

pub mod retry;
pub mod scheduler;
pub mod cycle;
