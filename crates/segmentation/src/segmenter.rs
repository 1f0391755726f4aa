//! Customer segmenter: first matching rule wins. The rule order below
//! decides who gets discounted; keep it in sync with `SegmentRule`.

use recovery_core::config::SegmentsConfig;
use recovery_core::types::{Customer, CustomerSegment};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which precedence rule placed the customer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "rule", content = "value")]
pub enum SegmentRule {
    TrustTag(String),
    WholesaleCartThreshold,
    LoyaltyThreshold,
    AtRiskTag(String),
    ReturningOrders,
    AccountWithoutOrders,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentAssignment {
    pub segment: CustomerSegment,
    pub rule: SegmentRule,
    pub discount_multiplier: f64,
    pub trust_level: u8,
}

pub struct CustomerSegmenter {
    config: SegmentsConfig,
}

impl CustomerSegmenter {
    pub fn new(config: SegmentsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmentsConfig {
        &self.config
    }

    /// Place a checkout's customer in exactly one segment. A guest checkout
    /// (`None`) can still trip the wholesale cart threshold; otherwise it is
    /// a new visitor.
    pub fn segment(&self, customer: Option<&Customer>, cart_value: f64) -> SegmentAssignment {
        let (segment, rule) = self.resolve(customer, cart_value);
        debug!(
            customer_id = customer.map(|c| c.id),
            segment = %segment,
            rule = ?rule,
            "Customer segmented"
        );
        SegmentAssignment {
            segment,
            rule,
            discount_multiplier: self.config.multiplier(segment),
            trust_level: self.config.trust_level(segment),
        }
    }

    fn resolve(&self, customer: Option<&Customer>, cart_value: f64) -> (CustomerSegment, SegmentRule) {
        let cfg = &self.config;

        if let Some(customer) = customer {
            if let Some(rule) = cfg.trust_tags.iter().find(|r| customer.has_tag(&r.tag)) {
                return (rule.segment, SegmentRule::TrustTag(rule.tag.clone()));
            }
        }

        if cart_value >= cfg.wholesale_cart_threshold {
            return (
                CustomerSegment::WholesaleLead,
                SegmentRule::WholesaleCartThreshold,
            );
        }

        let Some(customer) = customer else {
            return (CustomerSegment::NewVisitor, SegmentRule::Default);
        };

        if customer.orders_count >= cfg.loyal_min_orders || customer.total_spent >= cfg.loyal_min_spent
        {
            return (CustomerSegment::LoyalCustomer, SegmentRule::LoyaltyThreshold);
        }

        if let Some(tag) = cfg.at_risk_tags.iter().find(|t| customer.has_tag(t)) {
            return (
                CustomerSegment::ReturningCustomer,
                SegmentRule::AtRiskTag(tag.clone()),
            );
        }

        if customer.orders_count >= cfg.returning_min_orders {
            return (CustomerSegment::ReturningCustomer, SegmentRule::ReturningOrders);
        }

        if customer.has_account && customer.orders_count == 0 {
            return (CustomerSegment::NewCustomer, SegmentRule::AccountWithoutOrders);
        }

        (CustomerSegment::NewVisitor, SegmentRule::Default)
    }
}

impl Default for CustomerSegmenter {
    fn default() -> Self {
        Self::new(SegmentsConfig::default())
    }
}
