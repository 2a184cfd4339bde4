//! ---
//! cd_section: "03-persistence-logging"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Tenant persistence abstraction and scheduled sweeps."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! Scheduled trial expiration.
//!
//! Entitlement decisions already treat an ended trial as expired; the sweep
//! only brings the stored status in line. Every write is "set to expired if
//! still trialing", so overlapping or repeated runs converge on the same
//! state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crewdesk_common::config::SweeperConfig;
use crewdesk_common::time::Clock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::metrics::SweeperMetrics;
use crate::store::{StatusUpdate, StoreError, TenantStore};

/// Name of the advisory lease held while a sweep runs.
pub const SWEEP_LEASE: &str = "trial-expiration-sweep";

/// One company the sweep could not update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    /// Company that kept its old status.
    pub company_id: String,
    /// Failure description.
    pub error: String,
}

/// Summary of a sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Companies moved to `expired`.
    pub processed: usize,
    /// Companies whose update failed or timed out.
    pub failed: usize,
    /// Candidates another writer had already changed.
    pub unchanged: usize,
    /// Another holder owned the lease; nothing was visited.
    pub skipped: bool,
    /// Per-company failures.
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Candidates could not be listed.
    #[error("failed to list expired trials: {0}")]
    Upstream(#[from] StoreError),
}

/// Moves ended trials to `expired` in the tenant store.
#[derive(Debug, Clone)]
pub struct TrialExpirationSweeper {
    store: Arc<dyn TenantStore>,
    clock: Arc<dyn Clock>,
    row_timeout: Duration,
    lease_ttl: Duration,
    metrics: Option<SweeperMetrics>,
}

impl TrialExpirationSweeper {
    /// Create a sweeper with explicit bounds.
    pub fn new(
        store: Arc<dyn TenantStore>,
        clock: Arc<dyn Clock>,
        row_timeout: Duration,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            row_timeout,
            lease_ttl,
            metrics: None,
        }
    }

    /// Create a sweeper from the `sweeper` configuration table.
    pub fn from_config(
        store: Arc<dyn TenantStore>,
        clock: Arc<dyn Clock>,
        config: &SweeperConfig,
    ) -> Self {
        Self::new(store, clock, config.row_timeout, config.lease_ttl)
    }

    /// Attach metrics.
    pub fn with_metrics(mut self, metrics: SweeperMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one sweep. Row failures are collected in the report and left for
    /// the next run; only a failed candidate listing aborts.
    ///
    /// Every run takes the lease under its own holder id, so clones of one
    /// sweeper exclude each other like separate instances do.
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        let now = self.clock.now();
        let holder = format!("sweeper-{}", uuid::Uuid::new_v4());

        let lease_held = match self
            .store
            .acquire_lease(SWEEP_LEASE, &holder, self.lease_ttl, now)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                info!(holder = %holder, "sweep lease held elsewhere; skipping run");
                let report = SweepReport::skipped();
                if let Some(metrics) = &self.metrics {
                    metrics.record_report(&report, started.elapsed());
                }
                return Ok(report);
            }
            Err(err) => {
                warn!(error = %err, "sweep lease unavailable; continuing without it");
                false
            }
        };

        let candidates = match self.store.list_expired_trials(now).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "listing expired trials failed; aborting sweep");
                if lease_held {
                    self.release_lease(&holder).await;
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_aborted();
                }
                return Err(SweepError::Upstream(err));
            }
        };

        let mut report = SweepReport::default();
        for company in &candidates {
            let outcome = timeout(
                self.row_timeout,
                self.store.mark_trial_expired(&company.id, now),
            )
            .await;
            match outcome {
                Ok(Ok(StatusUpdate::Transitioned)) => {
                    report.processed += 1;
                    info!(company_id = %company.id, "trial expired");
                }
                Ok(Ok(StatusUpdate::Unchanged)) => report.unchanged += 1,
                Ok(Err(err)) => {
                    warn!(company_id = %company.id, error = %err, "failed to expire trial");
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        company_id: company.id.clone(),
                        error: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(
                        company_id = %company.id,
                        timeout_ms = self.row_timeout.as_millis() as u64,
                        "expiring trial timed out"
                    );
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        company_id: company.id.clone(),
                        error: format!("timed out after {:?}", self.row_timeout),
                    });
                }
            }
        }

        if lease_held {
            self.release_lease(&holder).await;
        }

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_report(&report, elapsed);
        }
        info!(
            candidates = candidates.len(),
            processed = report.processed,
            unchanged = report.unchanged,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "trial expiration sweep finished"
        );
        Ok(report)
    }

    async fn release_lease(&self, holder: &str) {
        if let Err(err) = self.store.release_lease(SWEEP_LEASE, holder).await {
            warn!(error = %err, "failed to release sweep lease");
        }
    }
}
