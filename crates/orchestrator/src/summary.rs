//! Per-checkout outcomes and the run summary printed at the end of a run.

use chrono::{DateTime, Utc};
use recovery_core::types::{CustomerSegment, ProductCategory};
use recovery_offers::DiscountDecision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Decide everything, write nothing.
    DryRun,
    Execute,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::DryRun => "dry_run",
            RunMode::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    /// Would have been sent in execute mode.
    DryRun,
    Skipped,
    Failed,
}

/// Why a checkout was not sent anything.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CheckoutCompleted,
    NoEmail,
    EmptyCart,
    EmptySchedule,
    NotYetDue,
    AlreadySent,
    StoreUnavailable,
    NoCustomerRecord,
    CustomerUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CheckoutCompleted => "checkout completed",
            SkipReason::NoEmail => "no email",
            SkipReason::EmptyCart => "empty cart",
            SkipReason::EmptySchedule => "empty schedule",
            SkipReason::NotYetDue => "not yet due",
            SkipReason::AlreadySent => "already sent",
            SkipReason::StoreUnavailable => "store unavailable",
            SkipReason::NoCustomerRecord => "no customer record",
            SkipReason::CustomerUnavailable => "customer unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutOutcome {
    pub checkout_id: String,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    pub step_id: Option<String>,
    pub step_number: Option<usize>,
    pub segment: Option<CustomerSegment>,
    pub dominant_category: Option<ProductCategory>,
    pub cart_value: f64,
    pub decision: Option<DiscountDecision>,
    pub subject: Option<String>,
    /// test id -> variant id.
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

impl CheckoutOutcome {
    pub fn new(checkout_id: &str, status: OutcomeStatus) -> Self {
        Self {
            checkout_id: checkout_id.to_string(),
            status,
            reason: None,
            step_id: None,
            step_number: None,
            segment: None,
            dominant_category: None,
            cart_value: 0.0,
            decision: None,
            subject: None,
            variants: BTreeMap::new(),
        }
    }

    pub fn skipped(checkout_id: &str, reason: SkipReason) -> Self {
        Self {
            reason: Some(reason.as_str().to_string()),
            ..Self::new(checkout_id, OutcomeStatus::Skipped)
        }
    }

    pub fn offers_discount(&self) -> bool {
        self.decision.as_ref().is_some_and(|d| d.should_discount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub checkouts_fetched: usize,
    pub processed: u64,
    pub sent: u64,
    pub dry_run: u64,
    pub skipped: u64,
    pub skipped_by_reason: BTreeMap<String, u64>,
    /// Discounts issued, or that would be issued in a dry run.
    pub discounts_issued: u64,
    pub failures: u64,
    pub outcomes: Vec<CheckoutOutcome>,
}

impl RunSummary {
    pub fn new(mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            started_at,
            finished_at: None,
            checkouts_fetched: 0,
            processed: 0,
            sent: 0,
            dry_run: 0,
            skipped: 0,
            skipped_by_reason: BTreeMap::new(),
            discounts_issued: 0,
            failures: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: CheckoutOutcome) {
        self.processed += 1;
        match outcome.status {
            OutcomeStatus::Sent => self.sent += 1,
            OutcomeStatus::DryRun => self.dry_run += 1,
            OutcomeStatus::Failed => self.failures += 1,
            OutcomeStatus::Skipped => {
                self.skipped += 1;
                let reason = outcome.reason.clone().unwrap_or_else(|| "unspecified".to_string());
                *self.skipped_by_reason.entry(reason).or_default() += 1;
            }
        }
        if matches!(outcome.status, OutcomeStatus::Sent | OutcomeStatus::DryRun)
            && outcome.offers_discount()
        {
            self.discounts_issued += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }
}
