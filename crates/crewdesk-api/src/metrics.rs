//! ---
//! cd_section: "05-networking-external-interfaces"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Scheduled trigger endpoints for external schedulers."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use anyhow::Result;
use crewdesk_common::metrics::SharedRegistry;
use prometheus::{IntCounterVec, Opts};

/// Counters for trigger requests by job and response status.
#[derive(Clone)]
pub struct TriggerMetrics {
    requests_total: IntCounterVec,
}

impl TriggerMetrics {
    /// Register the trigger metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "crewdesk_trigger_requests_total",
                "Scheduled trigger requests by job and response status",
            ),
            &["job", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;
        Ok(Self { requests_total })
    }

    /// Count one request.
    pub fn record(&self, job: &str, status: u16) {
        self.requests_total
            .with_label_values(&[job, &status.to_string()])
            .inc();
    }
}

impl std::fmt::Debug for TriggerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerMetrics").finish_non_exhaustive()
    }
}
