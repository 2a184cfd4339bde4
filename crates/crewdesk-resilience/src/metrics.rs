//! ---
//! cd_section: "07-resilience-fault-tolerance"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Resilience strategies for background polling."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use crewdesk_common::metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

use crate::polling::PollingState;

/// Metrics published by polling circuits.
#[derive(Clone)]
pub struct ResilienceMetrics {
    transitions_total: IntCounterVec,
    state: IntGaugeVec,
    backoff_seconds: HistogramVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "crewdesk_polling_transitions_total",
                "Polling circuit state transitions",
            ),
            &["loop", "state"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let state = IntGaugeVec::new(
            Opts::new(
                "crewdesk_polling_state",
                "Current polling circuit state (1 for the active state label)",
            ),
            &["loop", "state"],
        )?;
        registry.register(Box::new(state.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "crewdesk_polling_backoff_seconds",
            "Delay scheduled after a failed poll",
        )
        .buckets(prometheus::exponential_buckets(1.0, 2.0, 12)?);
        let backoff_seconds = HistogramVec::new(histogram_opts, &["loop"])?;
        registry.register(Box::new(backoff_seconds.clone()))?;

        Ok(Self {
            transitions_total,
            state,
            backoff_seconds,
        })
    }

    /// Track a transition into `state`.
    pub fn record_transition(&self, name: &str, state: PollingState) {
        self.transitions_total
            .with_label_values(&[name, state.label()])
            .inc();
        for label in PollingState::LABELS {
            let value = i64::from(*label == state.label());
            self.state.with_label_values(&[name, label]).set(value);
        }
    }

    /// Record a scheduled retry delay.
    pub fn observe_backoff(&self, name: &str, delay: Duration) {
        self.backoff_seconds
            .with_label_values(&[name])
            .observe(delay.as_secs_f64());
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
