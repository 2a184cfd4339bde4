//! ---
//! cd_section: "01-core-functionality"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Shared primitives and utilities for the CrewDesk services."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive override, e.g. `debug,crewdesk_sweeper=trace`.
pub const LOG_ENV: &str = "CREWDESK_LOG";
/// Stdout format override (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "CREWDESK_LOG_FORMAT";
const DEFAULT_DIRECTIVE: &str = "info";

/// Flush guards for the non-blocking writers. Held for the process lifetime.
struct LogGuards {
    _stdout: WorkerGuard,
    _file: WorkerGuard,
}

static GUARDS: OnceCell<LogGuards> = OnceCell::new();

/// Available log formats for stdout. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

impl LogFormat {
    /// Parse the value of [`LOG_FORMAT_ENV`]. Unknown values yield `None`.
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "structured-json" => Some(Self::StructuredJson),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Name of the daily log file for `service`. A configured prefix groups
/// several services under one name; the service still appears in the file.
pub fn log_file_name(service: &str, config: &LoggingConfig) -> String {
    match config.file_prefix.as_deref().map(str::trim) {
        Some(prefix) if !prefix.is_empty() && prefix != service => {
            format!("{prefix}-{service}.log")
        }
        _ => format!("{service}.log"),
    }
}

/// Pick the filter from the CrewDesk override, then `RUST_LOG`, then `info`.
/// An invalid override is reported on stderr and falls through.
fn build_filter(crewdesk_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    for (source, directive) in [(LOG_ENV, crewdesk_log), ("RUST_LOG", rust_log)] {
        let Some(directive) = directive.filter(|value| !value.trim().is_empty()) else {
            continue;
        };
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("invalid {source} directive ({err}); ignoring"),
        }
    }
    EnvFilter::new(DEFAULT_DIRECTIVE)
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::StructuredJson => layer
            .with_target(false)
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => layer.with_target(true).with_writer(writer).boxed(),
    }
}

/// Install the global subscriber for `service_name`.
///
/// Stdout gets `logging.format` unless `CREWDESK_LOG_FORMAT` overrides it.
/// Every event also lands as JSON in a daily file under `logging.directory`.
/// A second call keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let file_name = log_file_name(service_name, config);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let format = std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|value| LogFormat::from_env_value(&value))
        .unwrap_or(config.format);
    let filter = build_filter(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer(format, stdout_writer))
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = GUARDS.set(LogGuards {
        _stdout: stdout_guard,
        _file: file_guard,
    });

    info!(
        service = %service_name,
        log_file = %config.directory.join(&file_name).display(),
        format = ?format,
        "tracing initialised"
    );
    Ok(())
}
