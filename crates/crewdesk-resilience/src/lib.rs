//! ---
//! cd_section: "07-resilience-fault-tolerance"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Resilience strategies for background polling."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Backoff and suspension for periodic work that talks to shared infrastructure.

pub mod metrics;
pub mod polling;

pub use metrics::ResilienceMetrics;
pub use polling::{PollDirective, PollingCircuit, PollingPolicy, PollingState};
