//! Recovery event bus: trait for emitting run events from any module.
//!
//! The orchestrator accepts an `Arc<dyn EventSink>` and reports every
//! checkout it evaluates, sends, or skips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryEventType {
    CheckoutEvaluated,
    TouchpointSent,
    DiscountIssued,
    CheckoutSkipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub event_id: Uuid,
    pub event_type: RecoveryEventType,
    pub checkout_id: String,
    pub step_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting recovery events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RecoveryEvent);
}

/// No-op sink for runs that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: RecoveryEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<RecoveryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<RecoveryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_type(&self, event_type: RecoveryEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: RecoveryEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Convenience builder for creating a `RecoveryEvent`.
pub fn make_event(
    event_type: RecoveryEventType,
    checkout_id: impl Into<String>,
    step_id: Option<String>,
    detail: Option<String>,
) -> RecoveryEvent {
    RecoveryEvent {
        event_id: Uuid::new_v4(),
        event_type,
        checkout_id: checkout_id.into(),
        step_id,
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
