//! ---
//! cd_section: "03-persistence-logging"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Metrics collection and export utilities."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Content type matching [`encode_text`].
pub fn text_content_type() -> &'static str {
    prometheus::TEXT_FORMAT
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[test]
    fn registered_counters_are_encoded() {
        let registry = new_registry();
        let counter = IntCounter::with_opts(Opts::new("crewdesk_test_total", "test counter"))
            .unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);

        let body = encode_text(&registry).unwrap();
        assert!(body.contains("crewdesk_test_total 3"));
        assert!(text_content_type().starts_with("text/plain"));
    }
}
