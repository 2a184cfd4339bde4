//! ---
//! cd_section: "03-persistence-logging"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Tenant persistence abstraction and scheduled sweeps."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Tenant store collaborator and the trial expiration sweep that keeps the
//! persisted subscription status in line with the resolver.

pub mod metrics;
pub mod store;
pub mod sweeper;

pub use metrics::SweeperMetrics;
pub use store::{InMemoryTenantStore, StatusUpdate, StoreError, TenantStore};
pub use sweeper::{SweepError, SweepFailure, SweepReport, TrialExpirationSweeper, SWEEP_LEASE};
