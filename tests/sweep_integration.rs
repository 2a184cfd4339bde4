//! ---
//! cd_section: "15-testing-qa-runbook"
//! cd_subsection: "integration-tests"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Integration and validation tests for the CrewDesk stack."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crewdesk_access::{
    AccessRequest, Action, Company, DecisionReason, EntitlementEngine, Feature, LimitName,
    LimitValue, Principal, Resource, ResourceRef, Role, SubscriptionStatus,
};
use crewdesk_common::metrics::{encode_text, new_registry};
use crewdesk_common::time::FixedClock;
use crewdesk_resilience::{
    PollDirective, PollingCircuit, PollingPolicy, PollingState, ResilienceMetrics,
};
use crewdesk_sweeper::{
    InMemoryTenantStore, StatusUpdate, StoreError, SweepError, SweeperMetrics, TenantStore,
    TrialExpirationSweeper,
};

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

fn sweeper(store: Arc<dyn TenantStore>, now: DateTime<Utc>) -> TrialExpirationSweeper {
    TrialExpirationSweeper::new(
        store,
        Arc::new(FixedClock::new(now)),
        Duration::from_millis(250),
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn second_row_failure_is_isolated() {
    let store = InMemoryTenantStore::new();
    for id in ["co-1", "co-2", "co-3"] {
        store.insert(Company::new_trial(id, id, at(1), 3));
    }
    store.fail_updates_for("co-2");

    let registry = new_registry();
    let report = sweeper(Arc::new(store.clone()), at(10))
        .with_metrics(SweeperMetrics::new(registry.clone()).unwrap())
        .run()
        .await
        .unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].company_id, "co-2");
    for (id, status) in [
        ("co-1", SubscriptionStatus::Expired),
        ("co-2", SubscriptionStatus::Trialing),
        ("co-3", SubscriptionStatus::Expired),
    ] {
        assert_eq!(store.company(id).unwrap().subscription_status, status);
    }

    let text = encode_text(&registry).unwrap();
    assert!(text.contains("crewdesk_sweeper_rows_total{outcome=\"failed\"} 1"));
}

#[tokio::test]
async fn sweep_does_not_change_effective_entitlements() {
    let engine = EntitlementEngine::standard(None).unwrap();
    let store = InMemoryTenantStore::new();
    store.insert(Company::new_trial("co-1", "Brush & Co", at(1), 3));
    let admin = Principal::new("u-1", "owner@brush.example", Role::Admin).in_company("co-1");
    let request = AccessRequest::new(Action::Create, ResourceRef::new(Resource::Quote))
        .requiring(Feature::Materials);
    let now = at(10);

    let before = store.company("co-1").unwrap();
    let before_state = engine.resolve(&before, now);
    let before_decision = engine.authorize(&admin, Some(&before), &request, now);

    sweeper(Arc::new(store.clone()), now).run().await.unwrap();

    let after = store.company("co-1").unwrap();
    assert_eq!(after.subscription_status, SubscriptionStatus::Expired);
    assert_eq!(engine.resolve(&after, now), before_state);
    assert_eq!(
        engine.authorize(&admin, Some(&after), &request, now),
        before_decision
    );
    assert_eq!(before_decision.reason, DecisionReason::FeatureNotInTier);
}

/// Store whose candidate listing fails a fixed number of times.
#[derive(Debug)]
struct FlakyListing {
    inner: InMemoryTenantStore,
    remaining_failures: AtomicU32,
}

#[async_trait]
impl TenantStore for FlakyListing {
    async fn get_company(&self, id: &str) -> Result<Option<Company>, StoreError> {
        self.inner.get_company(id).await
    }

    async fn list_expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<Company>, StoreError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("replica lagging".into()));
        }
        self.inner.list_expired_trials(now).await
    }

    async fn mark_trial_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusUpdate, StoreError> {
        self.inner.mark_trial_expired(id, now).await
    }

    async fn reserve_usage(
        &self,
        id: &str,
        limit: LimitName,
        max: LimitValue,
    ) -> Result<bool, StoreError> {
        self.inner.reserve_usage(id, limit, max).await
    }

    async fn release_usage(&self, id: &str, limit: LimitName) -> Result<(), StoreError> {
        self.inner.release_usage(id, limit).await
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.acquire_lease(name, holder, ttl, now).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.inner.release_lease(name, holder).await
    }
}

#[tokio::test]
async fn listing_outages_back_off_then_suspend_until_resumed() {
    let inner = InMemoryTenantStore::new();
    inner.insert(Company::new_trial("co-1", "co-1", at(1), 3));
    let store = Arc::new(FlakyListing {
        inner: inner.clone(),
        remaining_failures: AtomicU32::new(3),
    });
    let sweeper = sweeper(store, at(10));

    let registry = new_registry();
    let circuit = PollingCircuit::new(
        "trial-expiration-sweep",
        PollingPolicy::new(
            3,
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::ZERO,
        ),
        Some(ResilienceMetrics::new(registry.clone()).unwrap()),
    );

    let mut directives = Vec::new();
    for _ in 0..3 {
        let err = sweeper.run().await.unwrap_err();
        assert!(matches!(err, SweepError::Upstream(StoreError::Unavailable(_))));
        directives.push(circuit.record_failure());
    }
    assert_eq!(
        directives,
        vec![
            PollDirective::RetryAfter(Duration::from_secs(10)),
            PollDirective::RetryAfter(Duration::from_secs(20)),
            PollDirective::Suspend,
        ]
    );
    assert_eq!(circuit.state(), PollingState::Suspended);

    circuit.record_success();
    assert!(circuit.is_suspended());
    assert!(circuit.resume());

    let report = sweeper.run().await.unwrap();
    circuit.record_success();
    assert_eq!(report.processed, 1);
    assert_eq!(circuit.state(), PollingState::Polling);
    assert_eq!(
        inner.company("co-1").unwrap().subscription_status,
        SubscriptionStatus::Expired
    );
    assert!(encode_text(&registry).unwrap().contains("crewdesk_polling"));
}
