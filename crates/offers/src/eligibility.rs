use recovery_core::types::Customer;
use serde::{Deserialize, Serialize};

/// Whether a checkout may receive a discount at all, decided before the
/// engine looks at the cart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    RateLimited,
    SegmentExcluded,
    /// Legacy rule: the customer already carries the issued tag.
    PreviouslyIssued,
    /// The rate-limit check could not be completed.
    Unavailable,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "eligible",
            Eligibility::RateLimited => "not eligible: rate limited",
            Eligibility::SegmentExcluded => "not eligible: segment excluded",
            Eligibility::PreviouslyIssued => "not eligible: discount previously issued",
            Eligibility::Unavailable => "not eligible: eligibility unavailable",
        }
    }

    pub fn from_rate_limit(allowed: bool) -> Self {
        if allowed {
            Eligibility::Eligible
        } else {
            Eligibility::RateLimited
        }
    }
}

/// Fallback rule when no persistence store is configured: a customer who
/// already carries `issued_tag` gets nothing more. Guests are eligible.
pub fn legacy_eligibility(customer: Option<&Customer>, issued_tag: &str) -> Eligibility {
    match customer {
        Some(c) if c.has_tag(issued_tag) => Eligibility::PreviouslyIssued,
        _ => Eligibility::Eligible,
    }
}
