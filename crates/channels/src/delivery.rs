//! Delivery through platform-native automation hooks: the rendered email is
//! written to a customer metafield, then tags are added that an external
//! workflow watches to send it.

use crate::content::EmailContent;
use chrono::{DateTime, Utc};
use recovery_core::config::DeliveryConfig;
use recovery_core::types::Checkout;
use recovery_core::{CommerceApi, RecoveryResult};
use recovery_offers::DiscountDecision;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const PENDING_EMAIL_KEY: &str = "pending_email";

/// What one delivery wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub checkout_id: String,
    pub customer_id: u64,
    pub step_id: String,
    pub tags: Vec<String>,
    pub metafield: String,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(DeliveryReceipt),
    Skipped { reason: String },
}

/// Metafield payload the email workflow reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEmail {
    pub checkout_id: String,
    pub step_id: String,
    pub step_number: usize,
    pub subject: String,
    pub preheader: String,
    pub html: String,
    pub text: String,
    pub cta_url: String,
    pub discount_code: Option<String>,
    pub discount_percent: u32,
    pub free_shipping: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub variants: std::collections::BTreeMap<String, String>,
}

pub struct TagDelivery {
    commerce: Arc<dyn CommerceApi>,
    config: DeliveryConfig,
    legacy_issued_tag: String,
}

impl TagDelivery {
    pub fn new(commerce: Arc<dyn CommerceApi>, config: DeliveryConfig, legacy_issued_tag: String) -> Self {
        info!(
            tag_prefix = %config.tag_prefix,
            namespace = %config.metafield_namespace,
            "Tag delivery initialized"
        );
        Self {
            commerce,
            config,
            legacy_issued_tag,
        }
    }

    pub fn step_tag(&self, step_number: usize) -> String {
        format!("{}-step-{}", self.config.tag_prefix, step_number)
    }

    pub fn pending_tag(&self) -> String {
        format!("{}-pending", self.config.tag_prefix)
    }

    /// Tags written for one touchpoint, in write order.
    pub fn tags_for(&self, step_number: usize, decision: &DiscountDecision) -> Vec<String> {
        let mut tags = vec![self.step_tag(step_number), self.pending_tag()];
        if decision.should_discount && !self.legacy_issued_tag.is_empty() {
            tags.push(self.legacy_issued_tag.clone());
        }
        tags
    }

    /// Metafield first so the workflow never fires on a stale payload.
    pub async fn deliver(
        &self,
        checkout: &Checkout,
        step_number: usize,
        content: &EmailContent,
        decision: &DiscountDecision,
        now: DateTime<Utc>,
    ) -> RecoveryResult<DeliveryOutcome> {
        let Some(customer_id) = checkout.customer_id else {
            debug!(checkout_id = %checkout.id, "Guest checkout; nothing to tag");
            return Ok(DeliveryOutcome::Skipped {
                reason: "no customer record".to_string(),
            });
        };

        let payload = PendingEmail {
            checkout_id: checkout.id.clone(),
            step_id: decision.step_id.clone(),
            step_number,
            subject: content.subject.clone(),
            preheader: content.preheader.clone(),
            html: content.html.clone(),
            text: content.text.clone(),
            cta_url: content.cta_url.clone(),
            discount_code: decision.code.clone().filter(|_| decision.should_discount),
            discount_percent: decision.discount_percent,
            free_shipping: decision.free_shipping,
            expires_at: (decision.should_discount && decision.expiry_hours > 0)
                .then(|| now + chrono::Duration::hours(i64::from(decision.expiry_hours))),
            variants: content.variants.clone(),
        };
        let value = serde_json::to_value(&payload)?;
        self.commerce
            .set_customer_metafield(customer_id, &self.config.metafield_namespace, PENDING_EMAIL_KEY, &value)
            .await?;

        let tags = self.tags_for(step_number, decision);
        self.commerce.tag_customer(customer_id, &tags).await?;

        metrics::counter!("recovery.emails_queued", "step" => decision.step_id.clone()).increment(1);
        info!(
            checkout_id = %checkout.id,
            customer_id,
            step = step_number,
            "Recovery email queued"
        );

        Ok(DeliveryOutcome::Delivered(DeliveryReceipt {
            checkout_id: checkout.id.clone(),
            customer_id,
            step_id: decision.step_id.clone(),
            tags,
            metafield: format!("{}.{}", self.config.metafield_namespace, PENDING_EMAIL_KEY),
            delivered_at: now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recovery_core::config::ContentStrategy;
    use recovery_core::types::{Customer, DiscountCode, DiscountCodeSpec};
    use recovery_core::ProductCatalog;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCommerce {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProductCatalog for RecordingCommerce {
        async fn fetch_product_tags(&self, _product_id: u64) -> RecoveryResult<Option<Vec<String>>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl CommerceApi for RecordingCommerce {
        async fn fetch_abandoned_checkouts(&self, _since: DateTime<Utc>) -> RecoveryResult<Vec<Checkout>> {
            Ok(Vec::new())
        }
        async fn fetch_customer(&self, _id: u64) -> RecoveryResult<Option<Customer>> {
            Ok(None)
        }
        async fn create_discount_code(&self, _spec: &DiscountCodeSpec) -> RecoveryResult<Option<DiscountCode>> {
            Ok(None)
        }
        async fn tag_customer(&self, customer_id: u64, tags: &[String]) -> RecoveryResult<()> {
            self.writes
                .lock()
                .unwrap()
                .push(format!("tags:{customer_id}:{}", tags.join("|")));
            Ok(())
        }
        async fn set_customer_metafield(
            &self,
            customer_id: u64,
            namespace: &str,
            key: &str,
            value: &serde_json::Value,
        ) -> RecoveryResult<()> {
            self.writes.lock().unwrap().push(format!(
                "metafield:{customer_id}:{namespace}.{key}:{}",
                value["discount_code"]
            ));
            Ok(())
        }
    }

    fn checkout(customer_id: Option<u64>) -> Checkout {
        let now = Utc::now();
        Checkout {
            id: "c-9".into(),
            token: None,
            email: Some("a@example.com".into()),
            customer_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            recovery_url: None,
            currency: "USD".into(),
            subtotal: 50.0,
            line_items: Vec::new(),
        }
    }

    fn content() -> EmailContent {
        EmailContent {
            subject: "s".into(),
            preheader: "p".into(),
            headline: "h".into(),
            cta_text: "c".into(),
            cta_url: "https://oilslickpad.com/cart".into(),
            html: "<p>h</p>".into(),
            text: "h".into(),
            strategy: ContentStrategy::Incentive,
            variants: Default::default(),
        }
    }

    fn decision(code: Option<&str>) -> DiscountDecision {
        DiscountDecision {
            should_discount: code.is_some(),
            discount_percent: if code.is_some() { 10 } else { 0 },
            free_shipping: false,
            code: code.map(str::to_string),
            expiry_hours: 48,
            savings_amount: 5.0,
            reason: None,
            step_id: "step_3_incentive".into(),
            base_percent: 10.0,
            multiplier: 1.0,
            ceiling_percent: 15.0,
            clamped: false,
        }
    }

    fn delivery(commerce: Arc<RecordingCommerce>) -> TagDelivery {
        TagDelivery::new(
            commerce,
            DeliveryConfig::default(),
            "cart-recovery-discount-issued".into(),
        )
    }

    #[tokio::test]
    async fn test_metafield_then_tags() {
        let commerce = Arc::new(RecordingCommerce::default());
        let outcome = delivery(commerce.clone())
            .deliver(&checkout(Some(44)), 3, &content(), &decision(Some("COMEBACK-BACK-AAAAAA")), Utc::now())
            .await
            .unwrap();

        let writes = commerce.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![
                "metafield:44:cart_recovery.pending_email:\"COMEBACK-BACK-AAAAAA\"".to_string(),
                "tags:44:cart-recovery-step-3|cart-recovery-pending|cart-recovery-discount-issued"
                    .to_string(),
            ]
        );
        match outcome {
            DeliveryOutcome::Delivered(receipt) => {
                assert_eq!(receipt.metafield, "cart_recovery.pending_email");
                assert_eq!(receipt.tags.len(), 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_legacy_tag_without_discount() {
        let commerce = Arc::new(RecordingCommerce::default());
        let d = delivery(commerce.clone());
        assert_eq!(
            d.tags_for(1, &decision(None)),
            vec!["cart-recovery-step-1".to_string(), "cart-recovery-pending".to_string()]
        );
    }

    #[tokio::test]
    async fn test_guest_checkout_is_skipped() {
        let commerce = Arc::new(RecordingCommerce::default());
        let outcome = delivery(commerce.clone())
            .deliver(&checkout(None), 1, &content(), &decision(None), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Skipped {
                reason: "no customer record".into()
            }
        );
        assert!(commerce.writes.lock().unwrap().is_empty());
    }
}
