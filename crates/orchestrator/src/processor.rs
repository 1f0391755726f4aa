//! Recovery orchestrator: one pass over the abandoned checkouts, one
//! decision per checkout, side effects only in execute mode.

use crate::summary::{CheckoutOutcome, OutcomeStatus, RunMode, RunSummary, SkipReason};
use chrono::{DateTime, Duration, Utc};
use recovery_channels::{DeliveryOutcome, EmailContent, EmailRenderer, RenderContext, TagDelivery};
use recovery_core::config::AppConfig;
use recovery_core::event_bus::{make_event, noop_sink};
use recovery_core::types::{
    Checkout, Customer, DiscountCodeRecord, InsertOutcome, RecoverySessionRecord,
};
use recovery_core::{CommerceApi, EventSink, RecoveryEventType, RecoveryResult, RecoveryStore};
use recovery_experimentation::{
    CounterStore, InMemoryCounterStore, SelectedVariant, StoreCounterStore, TestEvaluation,
    VariantAllocator,
};
use recovery_journey::{SequencePosition, SequenceResolver};
use recovery_offers::eligibility::legacy_eligibility;
use recovery_offers::{CodeGenerator, DiscountDecision, DiscountEngine, Eligibility};
use recovery_segmentation::{CartAnalysis, CartClassifier, CustomerSegmenter, SegmentAssignment};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RecoveryOrchestrator {
    config: AppConfig,
    mode: RunMode,
    commerce: Arc<dyn CommerceApi>,
    store: Option<Arc<dyn RecoveryStore>>,
    classifier: CartClassifier,
    segmenter: CustomerSegmenter,
    resolver: SequenceResolver,
    discounts: DiscountEngine,
    allocator: VariantAllocator,
    renderer: EmailRenderer,
    delivery: TagDelivery,
    events: Arc<dyn EventSink>,
}

/// Everything decided about a checkout before any side effect.
struct Evaluation {
    customer: Option<Customer>,
    analysis: CartAnalysis,
    segment: SegmentAssignment,
    position: SequencePosition,
    decision: DiscountDecision,
    variants: BTreeMap<String, SelectedVariant>,
}

impl RecoveryOrchestrator {
    /// Without a store, A/B counters stay in memory and eligibility falls
    /// back to the legacy tag rule.
    pub fn new(
        config: AppConfig,
        mode: RunMode,
        commerce: Arc<dyn CommerceApi>,
        store: Option<Arc<dyn RecoveryStore>>,
    ) -> Self {
        let counters: Arc<dyn CounterStore> = match &store {
            Some(store) => Arc::new(StoreCounterStore::new(store.clone())),
            None => Arc::new(InMemoryCounterStore::new()),
        };
        info!(
            mode = mode.as_str(),
            store = store.is_some(),
            touchpoints = config.sequence.touchpoints.len(),
            "Recovery orchestrator initialized"
        );
        Self {
            classifier: CartClassifier::new(config.catalog.clone()),
            segmenter: CustomerSegmenter::new(config.segments.clone()),
            resolver: SequenceResolver::from_config(&config.sequence),
            discounts: DiscountEngine::new(&config),
            allocator: VariantAllocator::new(&config.experiments, counters),
            renderer: EmailRenderer::new(config.delivery.clone()),
            delivery: TagDelivery::new(
                commerce.clone(),
                config.delivery.clone(),
                config.discounts.legacy_issued_tag.clone(),
            ),
            events: noop_sink(),
            config,
            mode,
            commerce,
            store,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_code_generator(mut self, codes: CodeGenerator) -> Self {
        self.discounts = DiscountEngine::with_generator(&self.config, codes);
        self
    }

    pub fn with_counter_store(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.allocator = VariantAllocator::new(&self.config.experiments, counters);
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub async fn evaluate_experiments(&self) -> RecoveryResult<Vec<TestEvaluation>> {
        self.allocator.evaluate_tests().await
    }

    /// Fetch checkouts from the lookback window and process up to
    /// `max_checkouts` of them, oldest activity first.
    pub async fn run(&self, now: DateTime<Utc>, max_checkouts: Option<usize>) -> RecoveryResult<RunSummary> {
        let mut summary = RunSummary::new(self.mode, now);
        let since = now - Duration::days(i64::from(self.config.sequence.lookback_days));

        let mut checkouts = self.commerce.fetch_abandoned_checkouts(since).await?;
        summary.checkouts_fetched = checkouts.len();
        checkouts.sort_by_key(|c| c.abandoned_at());
        let limit = max_checkouts.unwrap_or(usize::MAX);

        info!(
            fetched = checkouts.len(),
            limit = max_checkouts,
            since = %since,
            "Processing abandoned checkouts"
        );

        for checkout in checkouts.iter().take(limit) {
            let outcome = self.process_checkout(checkout, now).await;
            summary.record(outcome);
        }
        summary.finish(Utc::now());

        info!(
            processed = summary.processed,
            sent = summary.sent,
            dry_run = summary.dry_run,
            skipped = summary.skipped,
            discounts = summary.discounts_issued,
            failures = summary.failures,
            "Recovery run complete"
        );
        Ok(summary)
    }

    pub async fn process_checkout(&self, checkout: &Checkout, now: DateTime<Utc>) -> CheckoutOutcome {
        metrics::counter!("recovery.checkouts_processed").increment(1);
        let outcome = match self.evaluate(checkout, now).await {
            Ok(evaluation) => self.act(checkout, evaluation, now).await,
            Err(outcome) => outcome,
        };

        match outcome.status {
            OutcomeStatus::Skipped => {
                let reason = outcome.reason.clone().unwrap_or_default();
                debug!(checkout_id = %checkout.id, reason = %reason, "Checkout skipped");
                metrics::counter!("recovery.checkouts_skipped", "reason" => reason.clone()).increment(1);
                self.events.emit(make_event(
                    RecoveryEventType::CheckoutSkipped,
                    &checkout.id,
                    outcome.step_id.clone(),
                    Some(reason),
                ));
            }
            OutcomeStatus::Failed => {
                metrics::counter!("recovery.checkouts_failed").increment(1);
            }
            OutcomeStatus::Sent | OutcomeStatus::DryRun => {}
        }
        outcome
    }

    /// Every read-only step: classification, segmentation, sequence
    /// position, duplicate check, eligibility and the discount decision.
    async fn evaluate(&self, checkout: &Checkout, now: DateTime<Utc>) -> Result<Evaluation, CheckoutOutcome> {
        if checkout.is_completed() {
            return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::CheckoutCompleted));
        }
        let Some(email) = checkout.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::NoEmail));
        };
        if checkout.line_items.is_empty() {
            return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::EmptyCart));
        }

        // A checkout tied to a customer never falls back to guest handling.
        let customer = match checkout.customer_id {
            Some(id) => match self.commerce.fetch_customer(id).await {
                Ok(Some(customer)) => Some(customer),
                Ok(None) => {
                    warn!(checkout_id = %checkout.id, customer_id = id, "Customer record not found; skipping checkout");
                    return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::CustomerUnavailable));
                }
                Err(e) => {
                    warn!(checkout_id = %checkout.id, customer_id = id, error = %e, "Customer fetch failed; skipping checkout");
                    return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::CustomerUnavailable));
                }
            },
            None => None,
        };

        let analysis = self
            .classifier
            .classify(&checkout.line_items, self.commerce.as_ref())
            .await;
        let segment = self.segmenter.segment(customer.as_ref(), analysis.total_value);

        let abandoned_at = checkout.abandoned_at();
        let Some(furthest) = self.resolver.resolve(abandoned_at, now) else {
            return Err(CheckoutOutcome::skipped(&checkout.id, SkipReason::EmptySchedule));
        };
        let annotate = |mut outcome: CheckoutOutcome| {
            outcome.segment = Some(segment.segment);
            outcome.dominant_category = Some(analysis.dominant_category);
            outcome.cart_value = analysis.total_value;
            outcome
        };
        if !furthest.is_due {
            return Err(annotate(CheckoutOutcome::skipped(&checkout.id, SkipReason::NotYetDue)));
        }

        let sent = match &self.store {
            Some(store) => match store.has_already_sent(&checkout.id, &furthest.touchpoint.id).await {
                Ok(true) => BTreeSet::from([furthest.index]),
                Ok(false) => BTreeSet::new(),
                Err(e) => {
                    warn!(checkout_id = %checkout.id, error = %e, "Duplicate-send check failed; skipping checkout");
                    return Err(annotate(CheckoutOutcome::skipped(&checkout.id, SkipReason::StoreUnavailable)));
                }
            },
            None => self.sent_from_tags(customer.as_ref()),
        };
        let Some(position) = self.resolver.resolve_unsent(abandoned_at, now, &sent) else {
            let mut outcome = annotate(CheckoutOutcome::skipped(&checkout.id, SkipReason::AlreadySent));
            outcome.step_id = Some(furthest.touchpoint.id.clone());
            return Err(outcome);
        };
        self.events.emit(make_event(
            RecoveryEventType::CheckoutEvaluated,
            &checkout.id,
            Some(position.touchpoint.id.clone()),
            Some(format!(
                "segment={} category={} mixed={} tier={}",
                segment.segment, analysis.dominant_category, analysis.is_mixed_cart, analysis.value_tier
            )),
        ));

        let eligibility = self.eligibility(email, customer.as_ref()).await;
        let decision = self
            .discounts
            .decide(&analysis, segment.segment, &position, eligibility);
        let variants = self.allocator.select_variants(email);

        Ok(Evaluation {
            customer,
            analysis,
            segment,
            position,
            decision,
            variants,
        })
    }

    async fn eligibility(&self, email: &str, customer: Option<&Customer>) -> Eligibility {
        let discounts = &self.config.discounts;
        let Some(store) = &self.store else {
            return legacy_eligibility(customer, &discounts.legacy_issued_tag);
        };
        match store.check_discount_eligibility(email, &discounts.rate_limit).await {
            Ok(allowed) => Eligibility::from_rate_limit(allowed),
            Err(e) if discounts.fail_open_when_store_unreachable => {
                warn!(error = %e, "Eligibility check failed; failing open");
                Eligibility::Eligible
            }
            Err(e) => {
                warn!(error = %e, "Eligibility check failed; no discount");
                Eligibility::Unavailable
            }
        }
    }

    /// Steps already sent according to the customer's step tags. Only used
    /// when no store records sessions.
    fn sent_from_tags(&self, customer: Option<&Customer>) -> BTreeSet<usize> {
        let Some(customer) = customer else {
            return BTreeSet::new();
        };
        (0..self.resolver.touchpoints().len())
            .filter(|i| customer.has_tag(&self.delivery.step_tag(i + 1)))
            .collect()
    }

    fn render(&self, checkout: &Checkout, eval: &Evaluation, decision: &DiscountDecision) -> EmailContent {
        self.renderer.render(&RenderContext {
            checkout,
            customer: eval.customer.as_ref(),
            analysis: &eval.analysis,
            segment: eval.segment.segment,
            position: &eval.position,
            decision,
            variants: &eval.variants,
        })
    }

    fn outcome(&self, checkout: &Checkout, eval: &Evaluation, status: OutcomeStatus) -> CheckoutOutcome {
        CheckoutOutcome {
            step_id: Some(eval.position.touchpoint.id.clone()),
            step_number: Some(eval.position.step_number()),
            segment: Some(eval.segment.segment),
            dominant_category: Some(eval.analysis.dominant_category),
            cart_value: eval.analysis.total_value,
            decision: Some(eval.decision.clone()),
            variants: eval
                .variants
                .values()
                .map(|v| (v.test_id.clone(), v.variant_id.clone()))
                .collect(),
            ..CheckoutOutcome::new(&checkout.id, status)
        }
    }

    async fn act(&self, checkout: &Checkout, eval: Evaluation, now: DateTime<Utc>) -> CheckoutOutcome {
        if checkout.customer_id.is_none() {
            let mut outcome = self.outcome(checkout, &eval, OutcomeStatus::Skipped);
            outcome.reason = Some(SkipReason::NoCustomerRecord.as_str().to_string());
            return outcome;
        }

        if self.mode == RunMode::DryRun {
            let content = self.render(checkout, &eval, &eval.decision);
            let mut outcome = self.outcome(checkout, &eval, OutcomeStatus::DryRun);
            outcome.subject = Some(content.subject);
            info!(
                checkout_id = %checkout.id,
                step = %eval.position.touchpoint.id,
                segment = %eval.segment.segment,
                percent = eval.decision.discount_percent,
                free_shipping = eval.decision.free_shipping,
                code_preview = ?eval.decision.code,
                "Dry run: would send recovery email (code is a preview, not reserved or minted)"
            );
            return outcome;
        }

        let email = checkout.email.clone().unwrap_or_default();
        let decision = self.issue_code(checkout, &email, &eval, now).await;
        let content = self.render(checkout, &eval, &decision);

        let step_number = eval.position.step_number();
        match self
            .delivery
            .deliver(checkout, step_number, &content, &decision, now)
            .await
        {
            Ok(DeliveryOutcome::Delivered(_)) => {}
            Ok(DeliveryOutcome::Skipped { reason }) => {
                let mut outcome = self.outcome(checkout, &eval, OutcomeStatus::Skipped);
                outcome.reason = Some(reason);
                outcome.decision = Some(decision);
                return outcome;
            }
            Err(e) => {
                error!(checkout_id = %checkout.id, error = %e, "Delivery failed");
                let mut outcome = self.outcome(checkout, &eval, OutcomeStatus::Failed);
                outcome.reason = Some(format!("delivery failed: {e}"));
                outcome.decision = Some(decision);
                return outcome;
            }
        }

        self.record_session(checkout, &eval, &decision, now).await;
        for variant in eval.variants.values() {
            if let Err(e) = self
                .allocator
                .record_event(&variant.test_id, &variant.variant_id, "impression", &email, 0.0)
                .await
            {
                warn!(test_id = %variant.test_id, error = %e, "Failed to record A/B impression");
            }
        }

        let step_id = Some(eval.position.touchpoint.id.clone());
        self.events.emit(make_event(
            RecoveryEventType::TouchpointSent,
            &checkout.id,
            step_id.clone(),
            Some(content.subject.clone()),
        ));
        if decision.should_discount {
            self.events.emit(make_event(
                RecoveryEventType::DiscountIssued,
                &checkout.id,
                step_id,
                decision.code.clone(),
            ));
            metrics::counter!("recovery.discounts_issued").increment(1);
        }
        metrics::counter!("recovery.touchpoints_sent", "step" => eval.position.touchpoint.id.clone())
            .increment(1);

        let mut outcome = self.outcome(checkout, &eval, OutcomeStatus::Sent);
        outcome.subject = Some(content.subject);
        outcome.decision = Some(decision);
        outcome
    }

    /// Mint the decided code. The store's unique constraint is the final
    /// word on uniqueness; a collision there or at the platform regenerates
    /// the code, up to `max_code_attempts`. Any other failure drops the offer.
    async fn issue_code(
        &self,
        checkout: &Checkout,
        email: &str,
        eval: &Evaluation,
        now: DateTime<Utc>,
    ) -> DiscountDecision {
        let decision = &eval.decision;
        if !decision.should_discount || eval.position.touchpoint.fixed_code.is_some() {
            return decision.clone();
        }
        let segment = eval.segment.segment;
        let attempts = self.config.discounts.max_code_attempts.max(1);
        let mut code = decision
            .code
            .clone()
            .unwrap_or_else(|| self.discounts.regenerate_code(segment));

        for attempt in 0..attempts {
            if attempt > 0 {
                code = self.discounts.regenerate_code(segment);
            }
            let Some(spec) = self.discounts.code_spec(decision, &code, now) else {
                return decision.clone();
            };

            if let Some(store) = &self.store {
                let record = DiscountCodeRecord {
                    code: code.clone(),
                    email: email.to_string(),
                    checkout_id: checkout.id.clone(),
                    percent: spec.percent,
                    free_shipping: decision.free_shipping,
                    created_at: now,
                    expires_at: spec.ends_at,
                    redeemed_at: None,
                };
                match store.log_discount_code(&record).await {
                    Ok(InsertOutcome::Inserted) => {}
                    Ok(InsertOutcome::Duplicate) => {
                        warn!(code = %code, attempt, "Discount code collision in store; regenerating");
                        metrics::counter!("recovery.code_collisions").increment(1);
                        continue;
                    }
                    Err(e) => {
                        warn!(checkout_id = %checkout.id, error = %e, "Could not record discount code");
                        return decision.withdraw("discount code could not be recorded");
                    }
                }
            }

            match self.commerce.create_discount_code(&spec).await {
                Ok(Some(created)) => {
                    let mut issued = decision.clone();
                    issued.code = Some(created.code);
                    return issued;
                }
                Ok(None) => {
                    warn!(code = %code, attempt, "Platform rejected discount code; regenerating");
                    metrics::counter!("recovery.code_collisions").increment(1);
                }
                Err(e) => {
                    warn!(checkout_id = %checkout.id, error = %e, "Discount code creation failed");
                    return decision.withdraw("discount code creation failed");
                }
            }
        }
        decision.withdraw(format!("no unique discount code after {attempts} attempts"))
    }

    async fn record_session(
        &self,
        checkout: &Checkout,
        eval: &Evaluation,
        decision: &DiscountDecision,
        now: DateTime<Utc>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let record = RecoverySessionRecord {
            checkout_id: checkout.id.clone(),
            step_id: eval.position.touchpoint.id.clone(),
            step_index: eval.position.index,
            email: checkout.email.clone(),
            segment: eval.segment.segment,
            dominant_category: eval.analysis.dominant_category,
            cart_value: eval.analysis.total_value,
            discount_percent: decision.discount_percent,
            free_shipping: decision.free_shipping,
            discount_code: decision.code.clone().filter(|_| decision.should_discount),
            variants: eval
                .variants
                .values()
                .map(|v| (v.test_id.clone(), v.variant_id.clone()))
                .collect(),
            recorded_at: now,
        };
        match store.log_recovery_session(&record).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Duplicate) => {
                warn!(checkout_id = %checkout.id, step_id = %record.step_id, "Session already recorded by another run");
            }
            Err(e) => {
                error!(checkout_id = %checkout.id, error = %e, "Failed to record recovery session");
            }
        }
    }
}
