//! Discount decision engine: one auditable decision per checkout and touchpoint.

use crate::codes::CodeGenerator;
use crate::eligibility::Eligibility;
use chrono::{DateTime, Duration, Utc};
use recovery_core::config::{AppConfig, CatalogConfig, DiscountsConfig, SegmentsConfig};
use recovery_core::types::{CustomerSegment, DiscountCodeSpec, ProductCategory};
use recovery_journey::SequencePosition;
use recovery_segmentation::CartAnalysis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscountDecision {
    pub should_discount: bool,
    /// Whole percent. Zero when no discount or for free-shipping-only offers.
    pub discount_percent: u32,
    pub free_shipping: bool,
    pub code: Option<String>,
    pub expiry_hours: u32,
    pub savings_amount: f64,
    /// Set whenever `should_discount` is false.
    pub reason: Option<String>,
    pub step_id: String,
    pub base_percent: f64,
    pub multiplier: f64,
    pub ceiling_percent: f64,
    pub clamped: bool,
}

impl DiscountDecision {
    fn none(step_id: &str, reason: impl Into<String>) -> Self {
        Self {
            should_discount: false,
            discount_percent: 0,
            free_shipping: false,
            code: None,
            expiry_hours: 0,
            savings_amount: 0.0,
            reason: Some(reason.into()),
            step_id: step_id.to_string(),
            base_percent: 0.0,
            multiplier: 0.0,
            ceiling_percent: 0.0,
            clamped: false,
        }
    }

    /// This decision with its offer dropped, keeping the audit fields.
    pub fn withdraw(&self, reason: impl Into<String>) -> Self {
        Self {
            base_percent: self.base_percent,
            multiplier: self.multiplier,
            ceiling_percent: self.ceiling_percent,
            clamped: self.clamped,
            ..Self::none(&self.step_id, reason)
        }
    }
}

pub struct DiscountEngine {
    catalog: CatalogConfig,
    segments: SegmentsConfig,
    discounts: DiscountsConfig,
    codes: CodeGenerator,
}

impl DiscountEngine {
    pub fn new(config: &AppConfig) -> Self {
        let codes = CodeGenerator::new(&config.discounts.code_prefix, config.discounts.code_suffix_len);
        Self::with_generator(config, codes)
    }

    pub fn with_generator(config: &AppConfig, codes: CodeGenerator) -> Self {
        info!(
            min_order_value = config.discounts.min_order_value,
            excluded_segments = ?config.discounts.excluded_segments,
            no_discount_tiers = ?config.discounts.no_discount_tiers,
            "Discount engine initialized"
        );
        Self {
            catalog: config.catalog.clone(),
            segments: config.segments.clone(),
            discounts: config.discounts.clone(),
            codes,
        }
    }

    pub fn is_segment_excluded(&self, segment: CustomerSegment) -> bool {
        self.discounts.excluded_segments.contains(&segment)
    }

    /// Ceiling for a cart: the dominant category's, or the lower of the two
    /// primary categories' for a mixed cart. Unclassified items never lower it.
    pub fn ceiling_for(&self, analysis: &CartAnalysis) -> f64 {
        if analysis.is_mixed_cart {
            return ProductCategory::PRIMARY
                .iter()
                .map(|c| self.catalog.ceiling_for(*c))
                .fold(f64::INFINITY, f64::min);
        }
        self.catalog.ceiling_for(analysis.dominant_category)
    }

    pub fn decide(
        &self,
        analysis: &CartAnalysis,
        segment: CustomerSegment,
        position: &SequencePosition,
        eligibility: Eligibility,
    ) -> DiscountDecision {
        let touchpoint = &position.touchpoint;
        let step_id = touchpoint.id.as_str();

        if !eligibility.is_eligible() {
            return DiscountDecision::none(step_id, eligibility.reason());
        }
        if self.is_segment_excluded(segment) {
            return DiscountDecision::none(step_id, Eligibility::SegmentExcluded.reason());
        }
        if analysis.total_value < self.discounts.min_order_value {
            return DiscountDecision::none(
                step_id,
                format!(
                    "cart value ${:.2} below minimum order value ${:.2}",
                    analysis.total_value, self.discounts.min_order_value
                ),
            );
        }
        if self
            .discounts
            .no_discount_tiers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&analysis.value_tier))
        {
            return DiscountDecision::none(
                step_id,
                format!("value tier '{}' does not earn discounts", analysis.value_tier),
            );
        }

        let offer = touchpoint
            .escalation
            .lookup(analysis.dominant_category, analysis.is_mixed_cart);
        if offer.percent <= 0.0 && !offer.free_shipping {
            return DiscountDecision::none(step_id, "no offer at this step");
        }

        let multiplier = self.segments.multiplier(segment).max(0.0);
        let scaled = offer.percent.max(0.0) * multiplier;
        let ceiling = self.ceiling_for(analysis);
        let clamped = scaled > ceiling;
        if clamped {
            debug!(
                step_id,
                scaled,
                ceiling,
                category = %analysis.dominant_category,
                "Discount ceiling applied"
            );
            metrics::counter!("recovery.discount_ceiling_applied").increment(1);
        }
        let bounded = scaled.min(ceiling).max(0.0);
        let mut discount_percent = bounded.round();
        if discount_percent > ceiling {
            discount_percent = bounded.floor();
        }
        let discount_percent = discount_percent as u32;
        let free_shipping = offer.free_shipping && multiplier > 0.0;

        if discount_percent == 0 && !free_shipping {
            return DiscountDecision {
                base_percent: offer.percent,
                multiplier,
                ceiling_percent: ceiling,
                clamped,
                ..DiscountDecision::none(step_id, "no offer after segment adjustment")
            };
        }

        let code = touchpoint
            .fixed_code
            .clone()
            .unwrap_or_else(|| self.codes.generate(segment));
        let savings_amount =
            (analysis.total_value * f64::from(discount_percent) / 100.0 * 100.0).round() / 100.0;

        debug!(
            step_id,
            segment = %segment,
            base = offer.percent,
            multiplier,
            percent = discount_percent,
            free_shipping,
            "Discount decided"
        );

        DiscountDecision {
            should_discount: true,
            discount_percent,
            free_shipping,
            code: Some(code),
            expiry_hours: touchpoint.expiry_hours,
            savings_amount,
            reason: None,
            step_id: step_id.to_string(),
            base_percent: offer.percent,
            multiplier,
            ceiling_percent: ceiling,
            clamped,
        }
    }

    /// A fresh code for a retry after a uniqueness collision.
    pub fn regenerate_code(&self, segment: CustomerSegment) -> String {
        self.codes.generate(segment)
    }

    /// What the commerce platform needs to mint `code` for this decision.
    pub fn code_spec(
        &self,
        decision: &DiscountDecision,
        code: &str,
        now: DateTime<Utc>,
    ) -> Option<DiscountCodeSpec> {
        if !decision.should_discount {
            return None;
        }
        let expiry_hours = if decision.expiry_hours == 0 {
            24
        } else {
            decision.expiry_hours
        };
        Some(DiscountCodeSpec {
            code: code.to_string(),
            title: format!("Cart recovery {} {}", decision.step_id, code),
            percent: f64::from(decision.discount_percent),
            free_shipping: decision.free_shipping && decision.discount_percent == 0,
            usage_limit: 1,
            starts_at: now,
            ends_at: now + Duration::hours(i64::from(expiry_hours)),
            minimum_subtotal: Some(self.discounts.min_order_value),
        })
    }
}
