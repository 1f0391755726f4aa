//! Discount decisions for abandoned carts: eligibility, escalation,
//! segment scaling, category ceilings, and single-use codes.

pub mod codes;
pub mod eligibility;
pub mod engine;

pub use codes::CodeGenerator;
pub use eligibility::Eligibility;
pub use engine::{DiscountDecision, DiscountEngine};
