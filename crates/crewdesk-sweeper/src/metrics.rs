//! ---
//! cd_section: "03-persistence-logging"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Tenant persistence abstraction and scheduled sweeps."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use crewdesk_common::metrics::SharedRegistry;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts};

use crate::sweeper::SweepReport;

/// Metrics published by the trial expiration sweeper.
#[derive(Clone)]
pub struct SweeperMetrics {
    runs_total: IntCounterVec,
    rows_total: IntCounterVec,
    run_duration_seconds: Histogram,
}

impl SweeperMetrics {
    /// Register the sweeper metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new("crewdesk_sweeper_runs_total", "Trial expiration sweep runs"),
            &["outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let rows_total = IntCounterVec::new(
            Opts::new(
                "crewdesk_sweeper_rows_total",
                "Companies visited by the trial expiration sweep",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(rows_total.clone()))?;

        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "crewdesk_sweeper_run_duration_seconds",
                "Wall time of a completed sweep run",
            )
            .buckets(prometheus::exponential_buckets(0.01, 2.0, 14)?),
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        Ok(Self {
            runs_total,
            rows_total,
            run_duration_seconds,
        })
    }

    /// Record a run that visited its candidates.
    pub fn record_report(&self, report: &SweepReport, elapsed: Duration) {
        if report.skipped {
            self.runs_total.with_label_values(&["skipped"]).inc();
            return;
        }
        self.runs_total.with_label_values(&["completed"]).inc();
        self.rows_total
            .with_label_values(&["transitioned"])
            .inc_by(report.processed as u64);
        self.rows_total
            .with_label_values(&["unchanged"])
            .inc_by(report.unchanged as u64);
        self.rows_total
            .with_label_values(&["failed"])
            .inc_by(report.failed as u64);
        self.run_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Record a run aborted before visiting candidates.
    pub fn record_aborted(&self) {
        self.runs_total.with_label_values(&["aborted"]).inc();
    }
}

impl std::fmt::Debug for SweeperMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperMetrics").finish_non_exhaustive()
    }
}
