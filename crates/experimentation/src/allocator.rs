//! Variant allocator: hash-based bucketing of subjects into A/B variants
//! and confidence-gated winner selection.

use crate::counters::CounterStore;
use crate::stats::{two_proportion_z_test, ZTest};
use recovery_core::config::{AbTestConfig, ExperimentsConfig, PrimaryMetric};
use recovery_core::types::{AbEventType, VariantCounters};
use recovery_core::RecoveryResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedVariant {
    pub test_id: String,
    pub variant_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    InsufficientData,
    CollectingData,
    NoClearWinner,
    Winner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantReport {
    pub variant_id: String,
    pub counters: VariantCounters,
    /// Value of the test's primary metric.
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestEvaluation {
    pub test_id: String,
    pub element: String,
    pub primary_metric: PrimaryMetric,
    pub status: TestStatus,
    /// Ranked by rate, best first, once every variant has the minimum sample.
    pub variants: Vec<VariantReport>,
    pub winner: Option<String>,
    pub z_score: f64,
    pub confidence: f64,
}

/// Bucket for `(subject, test)`: SHA-256 of the concatenation, first 8 hex
/// characters read as a `u32`, modulo the variant count.
pub fn bucket(subject_id: &str, test_id: &str, num_variants: usize) -> usize {
    if num_variants == 0 {
        return 0;
    }
    let digest = Sha256::digest(format!("{subject_id}{test_id}").as_bytes());
    let hex = hex::encode(&digest[..4]);
    let value = u32::from_str_radix(&hex, 16).unwrap_or_default();
    value as usize % num_variants
}

/// Primary-metric rate; zero impressions give zero.
pub fn metric_rate(counters: &VariantCounters, metric: PrimaryMetric) -> f64 {
    if counters.impressions == 0 {
        return 0.0;
    }
    let impressions = counters.impressions as f64;
    match metric {
        PrimaryMetric::OpenRate => counters.opens as f64 / impressions,
        PrimaryMetric::ClickRate => counters.clicks as f64 / impressions,
        PrimaryMetric::ConversionRate => counters.conversions as f64 / impressions,
        PrimaryMetric::RevenuePerImpression => counters.revenue / impressions,
    }
}

pub struct VariantAllocator {
    tests: Vec<AbTestConfig>,
    min_sample_size: u64,
    confidence_level: f64,
    counters: Arc<dyn CounterStore>,
}

impl VariantAllocator {
    pub fn new(config: &ExperimentsConfig, counters: Arc<dyn CounterStore>) -> Self {
        info!(
            active_tests = config.tests.iter().filter(|t| t.active).count(),
            min_sample_size = config.min_sample_size,
            confidence_level = config.confidence_level,
            "Variant allocator initialized"
        );
        Self {
            tests: config.tests.clone(),
            min_sample_size: config.min_sample_size,
            confidence_level: config.confidence_level,
            counters,
        }
    }

    fn active_tests(&self) -> impl Iterator<Item = &AbTestConfig> {
        self.tests.iter().filter(|t| t.active && !t.variants.is_empty())
    }

    /// Element -> variant for every active test. Pure: the same subject
    /// always lands in the same variants. If two active tests control the
    /// same element, the first configured one wins.
    pub fn select_variants(&self, subject_id: &str) -> BTreeMap<String, SelectedVariant> {
        let mut selected = BTreeMap::new();
        for test in self.active_tests() {
            let idx = bucket(subject_id, &test.id, test.variants.len());
            let variant = &test.variants[idx];
            selected
                .entry(test.element.clone())
                .or_insert_with(|| SelectedVariant {
                    test_id: test.id.clone(),
                    variant_id: variant.id.clone(),
                    content: variant.content.clone(),
                });
        }
        selected
    }

    /// Count one event. Unknown event types are ignored and return `false`.
    pub async fn record_event(
        &self,
        test_id: &str,
        variant_id: &str,
        event_type: &str,
        subject_id: &str,
        value: f64,
    ) -> RecoveryResult<bool> {
        let Some(event) = AbEventType::parse(event_type) else {
            debug!(test_id, variant_id, event_type, "Ignoring unrecognized A/B event type");
            return Ok(false);
        };
        self.counters
            .increment(test_id, variant_id, event, subject_id, value)
            .await?;
        metrics::counter!("recovery.ab_events", "event" => event.as_str()).increment(1);
        Ok(true)
    }

    pub async fn evaluate_tests(&self) -> RecoveryResult<Vec<TestEvaluation>> {
        let results = self.counters.read().await?;
        let empty = HashMap::new();
        Ok(self
            .tests
            .iter()
            .filter(|t| t.active)
            .map(|test| {
                let counters = results.get(&test.id).unwrap_or(&empty);
                evaluate_test(test, counters, self.min_sample_size, self.confidence_level)
            })
            .collect())
    }
}

/// Evaluate one test against its counters.
pub fn evaluate_test(
    test: &AbTestConfig,
    counters: &HashMap<String, VariantCounters>,
    min_sample_size: u64,
    confidence_level: f64,
) -> TestEvaluation {
    let mut variants: Vec<VariantReport> = test
        .variants
        .iter()
        .map(|v| {
            let counters = counters.get(&v.id).cloned().unwrap_or_default();
            VariantReport {
                variant_id: v.id.clone(),
                rate: metric_rate(&counters, test.primary_metric),
                counters,
            }
        })
        .collect();

    let mut evaluation = TestEvaluation {
        test_id: test.id.clone(),
        element: test.element.clone(),
        primary_metric: test.primary_metric,
        status: TestStatus::InsufficientData,
        variants: Vec::new(),
        winner: None,
        z_score: 0.0,
        confidence: 0.0,
    };

    if variants.iter().all(|v| v.counters.is_empty()) {
        evaluation.variants = variants;
        return evaluation;
    }
    if variants
        .iter()
        .any(|v| v.counters.impressions < min_sample_size)
    {
        evaluation.status = TestStatus::CollectingData;
        evaluation.variants = variants;
        return evaluation;
    }

    variants.sort_by(|a, b| b.rate.total_cmp(&a.rate));
    let ZTest { z, confidence } = match (variants.first(), variants.get(1)) {
        (Some(best), Some(runner_up)) => two_proportion_z_test(
            best.rate,
            best.counters.impressions,
            runner_up.rate,
            runner_up.counters.impressions,
        ),
        _ => ZTest::default(),
    };

    evaluation.z_score = z;
    evaluation.confidence = confidence;
    if confidence >= confidence_level && confidence > 0.0 {
        evaluation.status = TestStatus::Winner;
        evaluation.winner = variants.first().map(|v| v.variant_id.clone());
    } else {
        evaluation.status = TestStatus::NoClearWinner;
    }
    evaluation.variants = variants;
    evaluation
}
