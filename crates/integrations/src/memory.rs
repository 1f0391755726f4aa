//! In-process recovery store for dry runs without a configured backend and
//! for tests. Enforces the same uniqueness keys as the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use recovery_core::config::RateLimitConfig;
use recovery_core::store::rate_limit_breach;
use recovery_core::types::{
    AbEventType, AbTestEvent, AbTestResults, CodeHistoryEntry, DiscountCodeRecord, InsertOutcome,
    RecoverySessionRecord,
};
use recovery_core::{RecoveryError, RecoveryResult, RecoveryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
pub struct InMemoryStore {
    sessions: DashMap<(String, String), RecoverySessionRecord>,
    codes: DashMap<String, DiscountCodeRecord>,
    events: Mutex<Vec<AbTestEvent>>,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backend were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> RecoveryResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RecoveryError::Store("store unreachable".into()))
        } else {
            Ok(())
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions ordered by checkout then step index.
    pub fn sessions(&self) -> Vec<RecoverySessionRecord> {
        let mut rows: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| {
            a.checkout_id
                .cmp(&b.checkout_id)
                .then(a.step_index.cmp(&b.step_index))
        });
        rows
    }

    pub fn discount_codes(&self) -> Vec<DiscountCodeRecord> {
        let mut rows: Vec<_> = self.codes.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    pub fn ab_events(&self) -> Vec<AbTestEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns false when the code is unknown.
    pub fn mark_redeemed(&self, code: &str, at: DateTime<Utc>) -> bool {
        match self.codes.get_mut(code) {
            Some(mut record) => {
                record.redeemed_at = Some(at);
                true
            }
            None => false,
        }
    }

    fn history_for(&self, email: &str) -> Vec<CodeHistoryEntry> {
        self.codes
            .iter()
            .filter(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().history_entry())
            .collect()
    }
}

#[async_trait]
impl RecoveryStore for InMemoryStore {
    async fn has_already_sent(&self, checkout_id: &str, step_id: &str) -> RecoveryResult<bool> {
        self.ensure_online()?;
        Ok(self
            .sessions
            .contains_key(&(checkout_id.to_string(), step_id.to_string())))
    }

    async fn check_discount_eligibility(
        &self,
        email: &str,
        limits: &RateLimitConfig,
    ) -> RecoveryResult<bool> {
        self.ensure_online()?;
        let history = self.history_for(email);
        Ok(rate_limit_breach(limits, &history, Utc::now()).is_none())
    }

    async fn log_discount_code(&self, record: &DiscountCodeRecord) -> RecoveryResult<InsertOutcome> {
        self.ensure_online()?;
        match self.codes.entry(record.code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(InsertOutcome::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn log_recovery_session(
        &self,
        record: &RecoverySessionRecord,
    ) -> RecoveryResult<InsertOutcome> {
        self.ensure_online()?;
        let key = (record.checkout_id.clone(), record.step_id.clone());
        match self.sessions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(InsertOutcome::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn log_ab_test_event(&self, event: &AbTestEvent) -> RecoveryResult<()> {
        self.ensure_online()?;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn get_ab_test_results(&self) -> RecoveryResult<AbTestResults> {
        self.ensure_online()?;
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut results = AbTestResults::new();
        for event in events.iter() {
            if let Some(kind) = AbEventType::parse(&event.event_type) {
                results
                    .entry(event.test_id.clone())
                    .or_default()
                    .entry(event.variant_id.clone())
                    .or_default()
                    .apply(kind, event.value);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recovery_core::types::{CustomerSegment, ProductCategory};

    fn code(code: &str, email: &str, days_ago: i64) -> DiscountCodeRecord {
        let created = Utc::now() - Duration::days(days_ago);
        DiscountCodeRecord {
            code: code.into(),
            email: email.into(),
            checkout_id: "c1".into(),
            percent: 10.0,
            free_shipping: false,
            created_at: created,
            expires_at: created + Duration::hours(48),
            redeemed_at: None,
        }
    }

    fn session(checkout: &str, step: &str, index: usize) -> RecoverySessionRecord {
        RecoverySessionRecord {
            checkout_id: checkout.into(),
            step_id: step.into(),
            step_index: index,
            email: None,
            segment: CustomerSegment::NewVisitor,
            dominant_category: ProductCategory::Extraction,
            cart_value: 40.0,
            discount_percent: 0,
            free_shipping: false,
            discount_code: None,
            variants: Default::default(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_uniqueness() {
        let store = InMemoryStore::new();
        let row = session("c1", "step_1_reminder", 0);
        assert_eq!(store.log_recovery_session(&row).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.log_recovery_session(&row).await.unwrap(), InsertOutcome::Duplicate);
        assert!(store.has_already_sent("c1", "step_1_reminder").await.unwrap());
        assert!(!store.has_already_sent("c1", "step_2_social_proof").await.unwrap());
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_and_cooldown() {
        let store = InMemoryStore::new();
        let limits = RateLimitConfig::default();
        store.log_discount_code(&code("A", "x@example.com", 40)).await.unwrap();
        assert!(store.check_discount_eligibility("x@example.com", &limits).await.unwrap());

        assert!(store.mark_redeemed("A", Utc::now() - Duration::days(3)));
        assert!(!store.check_discount_eligibility("X@example.com", &limits).await.unwrap());
        assert!(store.check_discount_eligibility("y@example.com", &limits).await.unwrap());
        assert!(!store.mark_redeemed("missing", Utc::now()));
    }

    #[tokio::test]
    async fn test_duplicate_code() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.log_discount_code(&code("A", "x@example.com", 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.log_discount_code(&code("A", "z@example.com", 0)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.discount_codes().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.has_already_sent("c1", "s").await,
            Err(RecoveryError::Store(_))
        ));
        store.set_offline(false);
        assert!(!store.has_already_sent("c1", "s").await.unwrap());
    }
}
