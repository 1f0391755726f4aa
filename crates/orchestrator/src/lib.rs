//! Per-checkout recovery pipeline and run bookkeeping.

pub mod processor;
pub mod summary;

pub use processor::RecoveryOrchestrator;
pub use summary::{CheckoutOutcome, OutcomeStatus, RunMode, RunSummary, SkipReason};
