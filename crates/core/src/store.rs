//! Persistence store contract plus the discount rate-limit policy every
//! store implementation evaluates the same way.

use crate::config::RateLimitConfig;
use crate::error::RecoveryResult;
use crate::types::{
    AbTestEvent, AbTestResults, CodeHistoryEntry, DiscountCodeRecord, InsertOutcome,
    RecoverySessionRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Whether a session row exists for (checkout, step).
    async fn has_already_sent(&self, checkout_id: &str, step_id: &str) -> RecoveryResult<bool>;

    /// Whether `email` may receive another discount code under `limits`.
    async fn check_discount_eligibility(
        &self,
        email: &str,
        limits: &RateLimitConfig,
    ) -> RecoveryResult<bool>;

    /// Insert-or-fail on the code's uniqueness constraint.
    async fn log_discount_code(&self, record: &DiscountCodeRecord) -> RecoveryResult<InsertOutcome>;

    /// Insert-or-fail on the (checkout_id, step_id) uniqueness constraint.
    async fn log_recovery_session(
        &self,
        record: &RecoverySessionRecord,
    ) -> RecoveryResult<InsertOutcome>;

    async fn log_ab_test_event(&self, event: &AbTestEvent) -> RecoveryResult<()>;

    async fn get_ab_test_results(&self) -> RecoveryResult<AbTestResults>;
}

/// Which limit a customer's code history breaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBreach {
    ThirtyDayWindow,
    NinetyDayWindow,
    RedemptionCooldown,
}

impl RateLimitBreach {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitBreach::ThirtyDayWindow => "30-day code limit reached",
            RateLimitBreach::NinetyDayWindow => "90-day code limit reached",
            RateLimitBreach::RedemptionCooldown => "cooling down after a recent redemption",
        }
    }
}

/// Evaluate a customer's code history against the rolling windows and the
/// post-redemption cooldown. `None` means another code is allowed.
pub fn rate_limit_breach(
    limits: &RateLimitConfig,
    history: &[CodeHistoryEntry],
    now: DateTime<Utc>,
) -> Option<RateLimitBreach> {
    let issued_since = |days: u32| {
        let cutoff = now - Duration::days(i64::from(days));
        history.iter().filter(|r| r.created_at >= cutoff).count() as u32
    };

    if issued_since(30) >= limits.max_codes_30d {
        return Some(RateLimitBreach::ThirtyDayWindow);
    }
    if issued_since(90) >= limits.max_codes_90d {
        return Some(RateLimitBreach::NinetyDayWindow);
    }

    let cooldown_start = now - Duration::days(i64::from(limits.redemption_cooldown_days));
    let recently_redeemed = history
        .iter()
        .filter_map(|r| r.redeemed_at)
        .any(|at| at >= cooldown_start);
    if recently_redeemed {
        return Some(RateLimitBreach::RedemptionCooldown);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(days_ago: i64, redeemed_days_ago: Option<i64>) -> CodeHistoryEntry {
        let now = Utc::now();
        CodeHistoryEntry {
            created_at: now - Duration::days(days_ago),
            redeemed_at: redeemed_days_ago.map(|d| now - Duration::days(d)),
        }
    }

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            max_codes_30d: 2,
            max_codes_90d: 3,
            redemption_cooldown_days: 14,
        }
    }

    #[test]
    fn test_empty_history_is_allowed() {
        assert_eq!(rate_limit_breach(&limits(), &[], Utc::now()), None);
    }

    #[test]
    fn test_thirty_day_window() {
        let history = vec![record(2, None), record(20, None)];
        assert_eq!(
            rate_limit_breach(&limits(), &history, Utc::now()),
            Some(RateLimitBreach::ThirtyDayWindow)
        );
    }

    #[test]
    fn test_ninety_day_window() {
        let history = vec![record(5, None), record(45, None), record(80, None)];
        assert_eq!(
            rate_limit_breach(&limits(), &history, Utc::now()),
            Some(RateLimitBreach::NinetyDayWindow)
        );
    }

    #[test]
    fn test_old_codes_fall_out_of_windows() {
        let history = vec![record(100, None), record(120, None), record(200, None)];
        assert_eq!(rate_limit_breach(&limits(), &history, Utc::now()), None);
    }

    #[test]
    fn test_redemption_cooldown() {
        let history = vec![record(60, Some(3))];
        assert_eq!(
            rate_limit_breach(&limits(), &history, Utc::now()),
            Some(RateLimitBreach::RedemptionCooldown)
        );
        let history = vec![record(60, Some(40))];
        assert_eq!(rate_limit_breach(&limits(), &history, Utc::now()), None);
    }
}
