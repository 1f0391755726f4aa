//! Recovery schedule: maps time since abandonment onto the ordered
//! multi-touch sequence.

pub mod resolver;

pub use recovery_core::config::{ContentStrategy, Touchpoint};
pub use resolver::{SequencePosition, SequenceResolver};
