//! ---
//! cd_section: "05-networking-external-interfaces"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Scheduled trigger endpoints for external schedulers."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! HTTP surface for external schedulers.
//!
//! Every job is reached through `POST /api/cron/{job}` behind one shared
//! secret. A request that fails the secret check never reaches the job.

pub mod auth;
pub mod jobs;
pub mod metrics;
pub mod server;

pub use jobs::{ForwardingJob, JobError, JobOutput, JobRegistry, ScheduledJob, TrialExpirationJob};
pub use metrics::TriggerMetrics;
pub use server::{router, spawn_api_server, ApiServer, ApiState};
