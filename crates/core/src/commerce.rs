//! Commerce platform contract. The core never talks HTTP itself; it calls
//! through these traits and degrades when a call fails.

use crate::error::RecoveryResult;
use crate::types::{Checkout, Customer, DiscountCode, DiscountCodeSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Product tag lookup, the only catalog call the cart classifier needs.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Tags for a product, or `None` when the product no longer exists.
    async fn fetch_product_tags(&self, product_id: u64) -> RecoveryResult<Option<Vec<String>>>;
}

#[async_trait]
pub trait CommerceApi: ProductCatalog {
    /// Open checkouts updated at or after `since`, all pages.
    async fn fetch_abandoned_checkouts(&self, since: DateTime<Utc>) -> RecoveryResult<Vec<Checkout>>;

    async fn fetch_customer(&self, customer_id: u64) -> RecoveryResult<Option<Customer>>;

    /// Mint a single-use code. `None` means the platform declined without an error.
    async fn create_discount_code(&self, spec: &DiscountCodeSpec) -> RecoveryResult<Option<DiscountCode>>;

    /// Merge `tags` into the customer's tag list.
    async fn tag_customer(&self, customer_id: u64, tags: &[String]) -> RecoveryResult<()>;

    async fn set_customer_metafield(
        &self,
        customer_id: u64,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> RecoveryResult<()>;
}
