//! A/B testing for recovery emails: deterministic variant allocation,
//! event counters behind a swappable store, and z-test winner evaluation.

pub mod allocator;
pub mod counters;
pub mod stats;

pub use allocator::{SelectedVariant, TestEvaluation, TestStatus, VariantAllocator};
pub use counters::{CounterStore, InMemoryCounterStore, StoreCounterStore};
