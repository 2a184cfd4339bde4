//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! Effective subscription state.
//!
//! The stored `subscription_status` on a company is only a cache written by the
//! trial sweeper and by support tooling. Every decision goes through
//! [`SubscriptionStateResolver::resolve`], which recomputes the state from the
//! stored fields and a clock reading, so an unswept trial cannot keep paid
//! access past its end date.

use chrono::{DateTime, Duration, Utc};
use crewdesk_common::config::SubscriptionConfig;
use serde::Serialize;

use crate::model::{Company, SubscriptionStatus};
use crate::tiers::Tier;

const SECONDS_PER_DAY: i64 = 86_400;

/// Tunables for the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    /// How long a `past_due` tenant keeps its stored tier.
    pub past_due_grace: Duration,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            past_due_grace: Duration::days(7),
        }
    }
}

impl SubscriptionPolicy {
    /// Build the policy from runtime configuration.
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        let grace = Duration::from_std(config.past_due_grace).unwrap_or(Duration::MAX);
        Self {
            past_due_grace: grace,
        }
    }
}

/// Effective state computed at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    /// Tier used for feature and limit lookups.
    pub effective_tier: Tier,
    /// Trialing and not yet past `trial_ends_at`.
    pub is_trial_active: bool,
    /// The trial or the past-due grace window has run out.
    pub is_expired: bool,
    /// Whole days left in the trial or grace window, rounded up.
    pub days_remaining: Option<i64>,
}

impl SubscriptionState {
    fn lapsed() -> Self {
        Self {
            effective_tier: Tier::LOWEST_UNPAID,
            is_trial_active: false,
            is_expired: true,
            days_remaining: None,
        }
    }
}

/// Pure resolver from a company snapshot and a clock reading to [`SubscriptionState`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStateResolver {
    policy: SubscriptionPolicy,
}

impl SubscriptionStateResolver {
    /// Create a resolver with the given policy.
    pub fn new(policy: SubscriptionPolicy) -> Self {
        Self { policy }
    }

    /// Compute the effective state. Rules are evaluated by stored status:
    ///
    /// 1. `canceled` resolves to [`Tier::Baseline`].
    /// 2. `trialing` past `trial_ends_at` (or without an end date) resolves to
    ///    [`Tier::LOWEST_UNPAID`] whatever the stored tier says.
    /// 3. `active` keeps the stored tier.
    /// 4. `past_due` keeps the stored tier for the grace window, then lapses
    ///    like an expired trial.
    /// 5. `expired` resolves to [`Tier::LOWEST_UNPAID`].
    pub fn resolve(&self, company: &Company, now: DateTime<Utc>) -> SubscriptionState {
        let stored = Tier::from(company.subscription_tier);
        match company.subscription_status {
            SubscriptionStatus::Canceled => SubscriptionState {
                effective_tier: Tier::Baseline,
                is_trial_active: false,
                is_expired: false,
                days_remaining: None,
            },
            SubscriptionStatus::Trialing => match company.trial_ends_at {
                Some(ends_at) if now <= ends_at => SubscriptionState {
                    effective_tier: stored,
                    is_trial_active: true,
                    is_expired: false,
                    days_remaining: Some(days_until(now, ends_at)),
                },
                _ => SubscriptionState::lapsed(),
            },
            SubscriptionStatus::Active => SubscriptionState {
                effective_tier: stored,
                is_trial_active: false,
                is_expired: false,
                days_remaining: None,
            },
            SubscriptionStatus::PastDue => {
                let grace_ends = company
                    .past_due_since
                    .and_then(|since| since.checked_add_signed(self.policy.past_due_grace));
                match grace_ends {
                    Some(ends_at) if now <= ends_at => SubscriptionState {
                        effective_tier: stored,
                        is_trial_active: false,
                        is_expired: false,
                        days_remaining: Some(days_until(now, ends_at)),
                    },
                    _ => SubscriptionState::lapsed(),
                }
            }
            SubscriptionStatus::Expired => SubscriptionState::lapsed(),
        }
    }
}

fn days_until(now: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - now).num_seconds().max(0);
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanTier;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn company(tier: PlanTier, status: SubscriptionStatus) -> Company {
        let mut company = Company::new_trial("co-1", "Acme Painting", at(1), 14);
        company.subscription_tier = tier;
        company.subscription_status = status;
        company
    }

    #[test]
    fn unswept_expired_trial_loses_paid_tier() {
        let mut company = company(PlanTier::Starter, SubscriptionStatus::Trialing);
        company.trial_ends_at = Some(at(1));
        let state = SubscriptionStateResolver::default().resolve(&company, at(10));
        assert!(state.is_expired);
        assert!(!state.is_trial_active);
        assert_eq!(state.effective_tier, Tier::Trial);
        assert_eq!(state.days_remaining, None);
    }

    #[test]
    fn active_trial_reports_days_remaining() {
        let company = company(PlanTier::Trial, SubscriptionStatus::Trialing);
        let now = at(5) + Duration::hours(6);
        let state = SubscriptionStateResolver::default().resolve(&company, now);
        assert!(state.is_trial_active);
        assert!(!state.is_expired);
        assert_eq!(state.effective_tier, Tier::Trial);
        assert_eq!(state.days_remaining, Some(10));
    }

    #[test]
    fn trial_end_instant_is_still_active() {
        let company = company(PlanTier::Trial, SubscriptionStatus::Trialing);
        let end = company.trial_ends_at.unwrap();
        let resolver = SubscriptionStateResolver::default();
        assert!(!resolver.resolve(&company, end).is_expired);
        assert!(resolver.resolve(&company, end + Duration::seconds(1)).is_expired);
    }

    #[test]
    fn trial_without_end_date_fails_closed() {
        let mut company = company(PlanTier::Professional, SubscriptionStatus::Trialing);
        company.trial_ends_at = None;
        let state = SubscriptionStateResolver::default().resolve(&company, at(2));
        assert!(state.is_expired);
        assert_eq!(state.effective_tier, Tier::Trial);
    }

    #[test]
    fn canceled_resolves_to_baseline() {
        let company = company(PlanTier::Enterprise, SubscriptionStatus::Canceled);
        let state = SubscriptionStateResolver::default().resolve(&company, at(2));
        assert_eq!(state.effective_tier, Tier::Baseline);
        assert!(!state.is_expired);
    }

    #[test]
    fn active_keeps_stored_tier_even_after_trial_date() {
        let company = company(PlanTier::Professional, SubscriptionStatus::Active);
        let state = SubscriptionStateResolver::default().resolve(&company, at(30));
        assert_eq!(state.effective_tier, Tier::Professional);
        assert!(!state.is_expired);
    }

    #[test]
    fn past_due_keeps_tier_within_grace_then_lapses() {
        let mut company = company(PlanTier::Professional, SubscriptionStatus::PastDue);
        company.past_due_since = Some(at(10));
        let resolver = SubscriptionStateResolver::new(SubscriptionPolicy {
            past_due_grace: Duration::days(3),
        });

        let within = resolver.resolve(&company, at(12));
        assert_eq!(within.effective_tier, Tier::Professional);
        assert_eq!(within.days_remaining, Some(1));
        assert!(!within.is_expired);

        let after = resolver.resolve(&company, at(14));
        assert_eq!(after.effective_tier, Tier::Trial);
        assert!(after.is_expired);
    }

    #[test]
    fn past_due_without_start_lapses_immediately() {
        let company = company(PlanTier::Enterprise, SubscriptionStatus::PastDue);
        let state = SubscriptionStateResolver::default().resolve(&company, at(2));
        assert_eq!(state.effective_tier, Tier::Trial);
        assert!(state.is_expired);
    }

    #[test]
    fn expired_status_uses_lowest_unpaid_tier() {
        let company = company(PlanTier::Enterprise, SubscriptionStatus::Expired);
        let state = SubscriptionStateResolver::default().resolve(&company, at(2));
        assert_eq!(state.effective_tier, Tier::Trial);
        assert!(state.is_expired);
    }

    #[test]
    fn policy_reads_grace_from_config() {
        let config = SubscriptionConfig {
            trial_days: 14,
            past_due_grace: std::time::Duration::from_secs(2 * 86_400),
        };
        assert_eq!(
            SubscriptionPolicy::from_config(&config).past_due_grace,
            Duration::days(2)
        );
    }
}
