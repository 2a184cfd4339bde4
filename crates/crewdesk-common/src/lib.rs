//! ---
//! cd_section: "01-core-functionality"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Shared primitives and utilities for the CrewDesk services."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! Core shared primitives for the CrewDesk workspace.
//! This crate exposes configuration loading, tracing initialisation, the shared
//! Prometheus registry, and the clock abstraction that keeps entitlement
//! decisions testable.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    AccessConfig, ApiConfig, AppConfig, ForwardJobConfig, FunctionsConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, PollingConfig, SubscriptionConfig, SweeperConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{new_registry, SharedRegistry};
pub use time::{Clock, FixedClock, SystemClock};
