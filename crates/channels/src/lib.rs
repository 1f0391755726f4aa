//! Recovery email rendering and delivery via customer tags and metafields.

pub mod content;
pub mod delivery;

pub use content::{EmailContent, EmailRenderer, RenderContext};
pub use delivery::{DeliveryOutcome, DeliveryReceipt, PendingEmail, TagDelivery};
