use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ─── Catalog ────────────────────────────────────────────────────────────────

/// Product categories known to the storefront. `Unknown` is the catch-all
/// bucket for items no vendor or tag rule claims.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    /// Extraction supplies and packaging. Low margin.
    Extraction,
    /// Smokeshop devices and accessories. High margin.
    Smokeshop,
    Unknown,
}

impl ProductCategory {
    /// The two categories that compete for dominance in a cart.
    pub const PRIMARY: [ProductCategory; 2] = [ProductCategory::Extraction, ProductCategory::Smokeshop];

    pub const ALL: [ProductCategory; 3] = [
        ProductCategory::Extraction,
        ProductCategory::Smokeshop,
        ProductCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::Extraction => "extraction",
            ProductCategory::Smokeshop => "smokeshop",
            ProductCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ProductCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Commerce Records ───────────────────────────────────────────────────────

/// One line of an abandoned checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub product_id: Option<u64>,
    pub variant_id: Option<u64>,
    pub title: String,
    pub vendor: Option<String>,
    pub quantity: u32,
    /// Unit price.
    pub price: f64,
}

impl LineItem {
    pub fn line_total(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

/// A started-but-not-completed checkout captured by the storefront.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkout {
    pub id: String,
    pub token: Option<String>,
    pub email: Option<String>,
    pub customer_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recovery_url: Option<String>,
    pub currency: String,
    pub subtotal: f64,
    pub line_items: Vec<LineItem>,
}

impl Checkout {
    /// Last storefront activity on the checkout; the recovery clock starts here.
    pub fn abandoned_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Customer record as far as segmentation cares.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Customer {
    pub id: u64,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub orders_count: u32,
    pub total_spent: f64,
    pub tags: Vec<String>,
    /// True when the customer has an enabled storefront account.
    pub has_account: bool,
}

impl Customer {
    /// Case-insensitive tag check.
    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = tag.trim();
        self.tags.iter().any(|t| t.trim().eq_ignore_ascii_case(wanted))
    }
}

// ─── Segments ───────────────────────────────────────────────────────────────

/// Mutually exclusive customer segments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CustomerSegment {
    NewVisitor,
    NewCustomer,
    ReturningCustomer,
    LoyalCustomer,
    WholesaleLead,
}

impl CustomerSegment {
    pub const ALL: [CustomerSegment; 5] = [
        CustomerSegment::NewVisitor,
        CustomerSegment::NewCustomer,
        CustomerSegment::ReturningCustomer,
        CustomerSegment::LoyalCustomer,
        CustomerSegment::WholesaleLead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerSegment::NewVisitor => "new_visitor",
            CustomerSegment::NewCustomer => "new_customer",
            CustomerSegment::ReturningCustomer => "returning_customer",
            CustomerSegment::LoyalCustomer => "loyal_customer",
            CustomerSegment::WholesaleLead => "wholesale_lead",
        }
    }

    /// Short uppercase form embedded in discount codes.
    pub fn code_fragment(&self) -> &'static str {
        match self {
            CustomerSegment::NewVisitor => "NEW",
            CustomerSegment::NewCustomer => "WELCOME",
            CustomerSegment::ReturningCustomer => "BACK",
            CustomerSegment::LoyalCustomer => "LOYAL",
            CustomerSegment::WholesaleLead => "TRADE",
        }
    }
}

impl std::fmt::Display for CustomerSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Discount Codes ─────────────────────────────────────────────────────────

/// What the commerce platform needs to mint a single-use code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscountCodeSpec {
    pub code: String,
    pub title: String,
    /// Whole percent off. Zero for free-shipping-only offers.
    pub percent: f64,
    pub free_shipping: bool,
    pub usage_limit: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub minimum_subtotal: Option<f64>,
}

/// A code the commerce platform accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscountCode {
    pub code: String,
    pub price_rule_id: Option<u64>,
    pub discount_code_id: Option<u64>,
}

// ─── Persisted Records ──────────────────────────────────────────────────────

/// Audit row for one issued discount code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscountCodeRecord {
    pub code: String,
    pub email: String,
    pub checkout_id: String,
    pub percent: f64,
    pub free_shipping: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl DiscountCodeRecord {
    pub fn history_entry(&self) -> CodeHistoryEntry {
        CodeHistoryEntry {
            created_at: self.created_at,
            redeemed_at: self.redeemed_at,
        }
    }
}

/// The part of a customer's code history the rate limiter reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CodeHistoryEntry {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// One row per (checkout, touchpoint) actually sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverySessionRecord {
    pub checkout_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub email: Option<String>,
    pub segment: CustomerSegment,
    pub dominant_category: ProductCategory,
    pub cart_value: f64,
    pub discount_percent: u32,
    pub free_shipping: bool,
    pub discount_code: Option<String>,
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

// ─── A/B Test Events ────────────────────────────────────────────────────────

/// Event types the variant counters understand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AbEventType {
    Impression,
    Open,
    Click,
    Conversion,
}

impl AbEventType {
    /// Lenient parse; unrecognized names yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "impression" | "sent" | "send" => Some(AbEventType::Impression),
            "open" | "opened" => Some(AbEventType::Open),
            "click" | "clicked" => Some(AbEventType::Click),
            "conversion" | "converted" | "purchase" => Some(AbEventType::Conversion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbEventType::Impression => "impression",
            AbEventType::Open => "open",
            AbEventType::Click => "click",
            AbEventType::Conversion => "conversion",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbTestEvent {
    pub test_id: String,
    pub variant_id: String,
    pub event_type: String,
    pub subject_id: String,
    pub value: f64,
    pub occurred_at: DateTime<Utc>,
}

/// Monotonic counters for one (test, variant) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariantCounters {
    pub impressions: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
}

impl VariantCounters {
    /// Apply one event. Revenue only accrues on conversions.
    pub fn apply(&mut self, event: AbEventType, value: f64) {
        match event {
            AbEventType::Impression => self.impressions += 1,
            AbEventType::Open => self.opens += 1,
            AbEventType::Click => self.clicks += 1,
            AbEventType::Conversion => {
                self.conversions += 1;
                if value.is_finite() && value > 0.0 {
                    self.revenue += value;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.impressions == 0 && self.opens == 0 && self.clicks == 0 && self.conversions == 0
    }
}

/// test id -> variant id -> counters.
pub type AbTestResults = HashMap<String, HashMap<String, VariantCounters>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_tag_match_is_case_insensitive() {
        let customer = Customer {
            tags: vec![" VIP ".to_string(), "newsletter".to_string()],
            ..Default::default()
        };
        assert!(customer.has_tag("vip"));
        assert!(customer.has_tag("Newsletter"));
        assert!(!customer.has_tag("wholesale"));
    }

    #[test]
    fn test_ab_event_parse() {
        assert_eq!(AbEventType::parse("Opened"), Some(AbEventType::Open));
        assert_eq!(AbEventType::parse("sent"), Some(AbEventType::Impression));
        assert_eq!(AbEventType::parse("bounce"), None);
    }

    #[test]
    fn test_counters_only_accrue_revenue_on_conversion() {
        let mut counters = VariantCounters::default();
        counters.apply(AbEventType::Click, 40.0);
        counters.apply(AbEventType::Conversion, 55.5);
        counters.apply(AbEventType::Conversion, f64::NAN);
        assert_eq!(counters.clicks, 1);
        assert_eq!(counters.conversions, 2);
        assert!((counters.revenue - 55.5).abs() < 1e-9);
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&ProductCategory::Smokeshop).unwrap();
        assert_eq!(json, "\"smokeshop\"");
        let seg: CustomerSegment = serde_json::from_str("\"loyal_customer\"").unwrap();
        assert_eq!(seg, CustomerSegment::LoyalCustomer);
    }
}
