//! Counter storage for A/B events. In-memory for tests and store-less runs,
//! store-backed in production.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use recovery_core::types::{AbEventType, AbTestEvent, AbTestResults, VariantCounters};
use recovery_core::{RecoveryResult, RecoveryStore};
use std::sync::Arc;

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(
        &self,
        test_id: &str,
        variant_id: &str,
        event: AbEventType,
        subject_id: &str,
        value: f64,
    ) -> RecoveryResult<()>;

    /// Snapshot of every (test, variant) counter set.
    async fn read(&self) -> RecoveryResult<AbTestResults>;
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<(String, String), VariantCounters>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        test_id: &str,
        variant_id: &str,
        event: AbEventType,
        _subject_id: &str,
        value: f64,
    ) -> RecoveryResult<()> {
        self.counters
            .entry((test_id.to_string(), variant_id.to_string()))
            .or_default()
            .apply(event, value);
        Ok(())
    }

    async fn read(&self) -> RecoveryResult<AbTestResults> {
        let mut results = AbTestResults::new();
        for entry in self.counters.iter() {
            let (test_id, variant_id) = entry.key();
            results
                .entry(test_id.clone())
                .or_default()
                .insert(variant_id.clone(), entry.value().clone());
        }
        Ok(results)
    }
}

/// Counters persisted as individual event rows in the recovery store.
pub struct StoreCounterStore {
    store: Arc<dyn RecoveryStore>,
}

impl StoreCounterStore {
    pub fn new(store: Arc<dyn RecoveryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CounterStore for StoreCounterStore {
    async fn increment(
        &self,
        test_id: &str,
        variant_id: &str,
        event: AbEventType,
        subject_id: &str,
        value: f64,
    ) -> RecoveryResult<()> {
        let row = AbTestEvent {
            test_id: test_id.to_string(),
            variant_id: variant_id.to_string(),
            event_type: event.as_str().to_string(),
            subject_id: subject_id.to_string(),
            value,
            occurred_at: Utc::now(),
        };
        self.store.log_ab_test_event(&row).await
    }

    async fn read(&self) -> RecoveryResult<AbTestResults> {
        self.store.get_ab_test_results().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_counters_accumulate() {
        let store = InMemoryCounterStore::new();
        store
            .increment("subject_line_v1", "control", AbEventType::Impression, "a@x.com", 0.0)
            .await
            .unwrap();
        store
            .increment("subject_line_v1", "control", AbEventType::Impression, "b@x.com", 0.0)
            .await
            .unwrap();
        store
            .increment("subject_line_v1", "control", AbEventType::Conversion, "b@x.com", 64.0)
            .await
            .unwrap();
        store
            .increment("subject_line_v1", "personal", AbEventType::Open, "c@x.com", 0.0)
            .await
            .unwrap();

        let results = store.read().await.unwrap();
        let control = &results["subject_line_v1"]["control"];
        assert_eq!(control.impressions, 2);
        assert_eq!(control.conversions, 1);
        assert_eq!(control.revenue, 64.0);
        assert_eq!(results["subject_line_v1"]["personal"].opens, 1);
    }
}
