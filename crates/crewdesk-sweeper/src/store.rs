//! ---
//! cd_section: "03-persistence-logging"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Tenant persistence abstraction and scheduled sweeps."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crewdesk_access::{AccessError, Company, CompanyId, LimitName, LimitValue, SubscriptionStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by a tenant store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or the operation failed in transit.
    #[error("tenant store unavailable: {0}")]
    Unavailable(String),
    /// No company with the given id.
    #[error("unknown company '{0}'")]
    UnknownCompany(CompanyId),
}

impl From<StoreError> for AccessError {
    fn from(value: StoreError) -> Self {
        AccessError::UpstreamUnavailable(value.to_string())
    }
}

/// Result of a status-guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusUpdate {
    /// The row moved to the new status.
    Transitioned,
    /// The guard did not match; nothing was written.
    Unchanged,
}

/// Persistence collaborator for tenant records.
///
/// Writes are guarded or compare-and-increment so that concurrent callers
/// cannot double-apply them.
#[async_trait]
pub trait TenantStore: Send + Sync + fmt::Debug {
    /// Load a company snapshot.
    async fn get_company(&self, id: &str) -> Result<Option<Company>, StoreError>;

    /// Companies still `trialing` whose trial ended before `now`. A missing
    /// end date counts as ended.
    async fn list_expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<Company>, StoreError>;

    /// Set `status = expired` only if the row is still `trialing` with a trial
    /// that ended before `now`.
    async fn mark_trial_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusUpdate, StoreError>;

    /// Atomically increment the usage counter if it is below `max`.
    /// Returns `false` without writing when the limit is already reached.
    async fn reserve_usage(
        &self,
        id: &str,
        limit: LimitName,
        max: LimitValue,
    ) -> Result<bool, StoreError>;

    /// Decrement a usage counter, saturating at zero.
    async fn release_usage(&self, id: &str, limit: LimitName) -> Result<(), StoreError>;

    /// Try to take the named advisory lease for `ttl`. An expired lease can be
    /// taken over; the current holder may renew.
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release the lease if `holder` still owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}

fn trial_ended(company: &Company, now: DateTime<Utc>) -> bool {
    company.subscription_status == SubscriptionStatus::Trialing
        && company.trial_ends_at.map_or(true, |ends_at| ends_at < now)
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    listing: AtomicBool,
    leases: AtomicBool,
    updates: Mutex<HashSet<CompanyId>>,
    update_delays: Mutex<HashMap<CompanyId, Duration>>,
}

/// In-memory [`TenantStore`] for development and tests, with fault injection.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTenantStore {
    companies: Arc<RwLock<HashMap<CompanyId, Company>>>,
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    faults: Arc<Faults>,
}

impl InMemoryTenantStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a company.
    pub fn insert(&self, company: Company) {
        self.companies.write().insert(company.id.clone(), company);
    }

    /// Synchronous snapshot of a company.
    pub fn company(&self, id: &str) -> Option<Company> {
        self.companies.read().get(id).cloned()
    }

    /// Make candidate listing fail.
    pub fn fail_listing(&self, fail: bool) {
        self.faults.listing.store(fail, Ordering::SeqCst);
    }

    /// Make lease operations fail.
    pub fn fail_leases(&self, fail: bool) {
        self.faults.leases.store(fail, Ordering::SeqCst);
    }

    /// Make status updates for one company fail.
    pub fn fail_updates_for(&self, id: impl Into<CompanyId>) {
        self.faults.updates.lock().insert(id.into());
    }

    /// Delay status updates for one company.
    pub fn delay_updates_for(&self, id: impl Into<CompanyId>, delay: Duration) {
        self.faults.update_delays.lock().insert(id.into(), delay);
    }

    /// Clear all injected faults.
    pub fn clear_faults(&self) {
        self.faults.listing.store(false, Ordering::SeqCst);
        self.faults.leases.store(false, Ordering::SeqCst);
        self.faults.updates.lock().clear();
        self.faults.update_delays.lock().clear();
    }

    fn check_leases(&self) -> Result<(), StoreError> {
        if self.faults.leases.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lease table offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get_company(&self, id: &str) -> Result<Option<Company>, StoreError> {
        Ok(self.company(id))
    }

    async fn list_expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<Company>, StoreError> {
        if self.faults.listing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("candidate query failed".into()));
        }
        let mut candidates: Vec<Company> = self
            .companies
            .read()
            .values()
            .filter(|company| trial_ended(company, now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(candidates)
    }

    async fn mark_trial_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusUpdate, StoreError> {
        let delay = self.faults.update_delays.lock().get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.updates.lock().contains(id) {
            return Err(StoreError::Unavailable(format!(
                "write to company '{id}' failed"
            )));
        }

        let mut companies = self.companies.write();
        let company = companies
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCompany(id.to_owned()))?;
        if !trial_ended(company, now) {
            debug!(company_id = id, status = %company.subscription_status, "status guard not met");
            return Ok(StatusUpdate::Unchanged);
        }
        company.subscription_status = SubscriptionStatus::Expired;
        Ok(StatusUpdate::Transitioned)
    }

    async fn reserve_usage(
        &self,
        id: &str,
        limit: LimitName,
        max: LimitValue,
    ) -> Result<bool, StoreError> {
        let mut companies = self.companies.write();
        let company = companies
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCompany(id.to_owned()))?;
        let counter = company.usage_counters.entry(limit).or_insert(0);
        if max.is_reached(*counter) {
            return Ok(false);
        }
        *counter += 1;
        Ok(true)
    }

    async fn release_usage(&self, id: &str, limit: LimitName) -> Result<(), StoreError> {
        let mut companies = self.companies.write();
        let company = companies
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCompany(id.to_owned()))?;
        if let Some(counter) = company.usage_counters.get_mut(&limit) {
            *counter = counter.saturating_sub(1);
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_leases()?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| StoreError::Unavailable(format!("invalid lease ttl: {err}")))?;
        let mut leases = self.leases.lock();
        if let Some(current) = leases.get(name) {
            if current.holder != holder && current.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_owned(),
            Lease {
                holder: holder.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.check_leases()?;
        let mut leases = self.leases.lock();
        if leases.get(name).is_some_and(|lease| lease.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}
