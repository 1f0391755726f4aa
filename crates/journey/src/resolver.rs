use chrono::{DateTime, Utc};
use recovery_core::config::{SequenceConfig, Touchpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencePosition {
    /// Zero-based index into the schedule.
    pub index: usize,
    pub touchpoint: Touchpoint,
    pub is_first_touch: bool,
    pub is_last_touch: bool,
    /// False when even the first touchpoint's delay has not elapsed yet.
    pub is_due: bool,
    pub elapsed_minutes: i64,
}

impl SequencePosition {
    /// One-based step number, as used in delivery tags.
    pub fn step_number(&self) -> usize {
        self.index + 1
    }
}

/// Resolves where a checkout sits in the recovery schedule.
#[derive(Debug, Clone)]
pub struct SequenceResolver {
    touchpoints: Vec<Touchpoint>,
}

impl SequenceResolver {
    /// Touchpoints are kept in ascending delay order.
    pub fn new(mut touchpoints: Vec<Touchpoint>) -> Self {
        touchpoints.sort_by_key(|tp| tp.delay_minutes);
        info!(
            touchpoints = touchpoints.len(),
            last_delay_minutes = touchpoints.last().map(|tp| tp.delay_minutes),
            "Sequence resolver initialized"
        );
        Self { touchpoints }
    }

    pub fn from_config(config: &SequenceConfig) -> Self {
        Self::new(config.touchpoints.clone())
    }

    pub fn touchpoints(&self) -> &[Touchpoint] {
        &self.touchpoints
    }

    pub fn touchpoint(&self, step_id: &str) -> Option<&Touchpoint> {
        self.touchpoints.iter().find(|tp| tp.id == step_id)
    }

    /// Furthest touchpoint whose delay has elapsed, or the first one when
    /// none has. `None` only for an empty schedule.
    pub fn resolve(&self, abandoned_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<SequencePosition> {
        let first = self.touchpoints.first()?;
        let elapsed_minutes = (now - abandoned_at).num_minutes();

        let mut index = 0;
        for (i, tp) in self.touchpoints.iter().enumerate() {
            if elapsed_minutes >= tp.delay_minutes {
                index = i;
            } else {
                break;
            }
        }

        let touchpoint = self.touchpoints[index].clone();
        Some(SequencePosition {
            index,
            is_first_touch: index == 0,
            is_last_touch: index + 1 == self.touchpoints.len(),
            is_due: elapsed_minutes >= first.delay_minutes,
            elapsed_minutes,
            touchpoint,
        })
    }

    /// The touchpoint to send now, given the indices already sent for this
    /// checkout. Never goes backwards: once a touchpoint at or beyond the
    /// furthest eligible one has gone out, nothing is due until the next
    /// delay elapses. Earlier unsent touchpoints are skipped.
    pub fn resolve_unsent(
        &self,
        abandoned_at: DateTime<Utc>,
        now: DateTime<Utc>,
        sent: &BTreeSet<usize>,
    ) -> Option<SequencePosition> {
        let position = self.resolve(abandoned_at, now)?;
        if !position.is_due {
            return None;
        }
        if let Some(&last_sent) = sent.iter().next_back() {
            if last_sent >= position.index {
                debug!(
                    index = position.index,
                    last_sent, "Furthest eligible touchpoint already sent"
                );
                return None;
            }
        }
        Some(position)
    }
}

impl Default for SequenceResolver {
    fn default() -> Self {
        Self::from_config(&SequenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn at(minutes: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let abandoned = Utc::now();
        (abandoned, abandoned + Duration::minutes(minutes))
    }

    #[test]
    fn test_too_early_returns_first_touch_not_due() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(10);
        let pos = resolver.resolve(abandoned, now).unwrap();
        assert_eq!(pos.index, 0);
        assert!(pos.is_first_touch);
        assert!(!pos.is_due);
        assert_eq!(pos.elapsed_minutes, 10);
    }

    #[test]
    fn test_resolves_furthest_elapsed_step() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(50 * 60);
        let pos = resolver.resolve(abandoned, now).unwrap();
        assert_eq!(pos.index, 2);
        assert_eq!(pos.touchpoint.id, "step_3_incentive");
        assert_eq!(pos.step_number(), 3);
        assert!(pos.is_due);
        assert!(!pos.is_last_touch);
    }

    #[test]
    fn test_exact_delay_counts_as_elapsed() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(24 * 60);
        assert_eq!(resolver.resolve(abandoned, now).unwrap().index, 1);
    }

    #[test]
    fn test_last_touch() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(30 * 24 * 60);
        let pos = resolver.resolve(abandoned, now).unwrap();
        assert!(pos.is_last_touch);
        assert_eq!(pos.index, 4);
    }

    #[test]
    fn test_empty_schedule() {
        let resolver = SequenceResolver::new(Vec::new());
        let (abandoned, now) = at(100);
        assert!(resolver.resolve(abandoned, now).is_none());
    }

    #[test]
    fn test_unsent_skips_when_already_sent() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(30 * 60);
        let sent: BTreeSet<usize> = [1].into_iter().collect();
        assert!(resolver.resolve_unsent(abandoned, now, &sent).is_none());
    }

    #[test]
    fn test_unsent_jumps_past_missed_steps() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(80 * 60);
        let sent: BTreeSet<usize> = [0].into_iter().collect();
        let pos = resolver.resolve_unsent(abandoned, now, &sent).unwrap();
        assert_eq!(pos.index, 3);
    }

    #[test]
    fn test_unsent_not_due() {
        let resolver = SequenceResolver::default();
        let (abandoned, now) = at(5);
        assert!(resolver
            .resolve_unsent(abandoned, now, &BTreeSet::new())
            .is_none());
    }

    proptest! {
        #[test]
        fn property_resolution_never_moves_backwards(a in 0i64..20_000, b in 0i64..20_000) {
            let resolver = SequenceResolver::default();
            let abandoned = Utc::now();
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let first = resolver.resolve(abandoned, abandoned + Duration::minutes(early)).unwrap();
            let second = resolver.resolve(abandoned, abandoned + Duration::minutes(late)).unwrap();
            prop_assert!(first.index <= second.index);
            prop_assert!(second.elapsed_minutes >= second.touchpoint.delay_minutes || second.index == 0);
        }
    }
}
