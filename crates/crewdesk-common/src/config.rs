//! ---
//! cd_section: "01-core-functionality"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Shared primitives and utilities for the CrewDesk services."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Name reserved for the in-process trial expiration job.
pub const TRIAL_EXPIRATION_JOB: &str = "trial-expiration";

fn default_trial_days() -> u32 {
    14
}

fn default_past_due_grace() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_row_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_polling_base_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_polling_max_delay() -> Duration {
    Duration::from_secs(900)
}

fn default_polling_jitter() -> Duration {
    Duration::from_secs(5)
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cron_secret_env() -> String {
    "CREWDESK_CRON_SECRET".to_owned()
}

fn default_functions_key_env() -> String {
    "CREWDESK_FUNCTIONS_KEY".to_owned()
}

fn default_functions_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the CrewDesk runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CREWDESK_CONFIG";

    /// Load configuration from disk, respecting the `CREWDESK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.access.validate()?;
        self.subscription.validate()?;
        self.sweeper.validate()?;
        self.functions.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Access-control settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    /// The single address whose admin account is treated as super admin.
    #[serde(default)]
    pub super_admin_email: Option<String>,
}

impl AccessConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(email) = &self.super_admin_email {
            let trimmed = email.trim();
            if trimmed.is_empty() || !trimmed.contains('@') {
                return Err(anyhow!(
                    "access.super_admin_email '{}' is not a valid address",
                    email
                ));
            }
        }
        Ok(())
    }
}

/// Trial and billing-grace windows used by the subscription resolver.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    #[serde(default = "default_past_due_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub past_due_grace: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            trial_days: default_trial_days(),
            past_due_grace: default_past_due_grace(),
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trial_days == 0 {
            return Err(anyhow!("subscription.trial_days must be at least 1"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_row_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub row_timeout: Duration,
    #[serde(default = "default_lease_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lease_ttl: Duration,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval: default_sweep_interval(),
            row_timeout: default_row_timeout(),
            lease_ttl: default_lease_ttl(),
            polling: PollingConfig::default(),
        }
    }
}

impl SweeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("sweeper.interval must be greater than zero"));
        }
        if self.row_timeout.is_zero() {
            return Err(anyhow!("sweeper.row_timeout must be greater than zero"));
        }
        if self.lease_ttl < self.row_timeout {
            return Err(anyhow!(
                "sweeper.lease_ttl must not be shorter than sweeper.row_timeout"
            ));
        }
        self.polling.validate()
    }
}

/// Backoff bounds applied to the periodic sweep loop.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_polling_base_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_polling_max_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_polling_jitter")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            base_delay: default_polling_base_delay(),
            max_delay: default_polling_max_delay(),
            jitter: default_polling_jitter(),
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!(
                "sweeper.polling.max_consecutive_failures must be at least 1"
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(anyhow!(
                "sweeper.polling.max_delay must not be shorter than base_delay"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    /// Environment variable holding the shared secret for scheduled triggers.
    #[serde(default = "default_cron_secret_env")]
    pub cron_secret_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
            cron_secret_env: default_cron_secret_env(),
        }
    }
}

impl ApiConfig {
    /// Read the trigger secret from the environment. Blank values count as missing.
    pub fn cron_secret(&self) -> Option<String> {
        read_secret(&self.cron_secret_env)
    }
}

/// External functions host that forwarding jobs call into.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_functions_key_env")]
    pub service_key_env: String,
    #[serde(default = "default_functions_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default)]
    pub jobs: IndexMap<String, ForwardJobConfig>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            service_key_env: default_functions_key_env(),
            timeout: default_functions_timeout(),
            jobs: IndexMap::new(),
        }
    }
}

impl FunctionsConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, job) in &self.jobs {
            if name == TRIAL_EXPIRATION_JOB {
                return Err(anyhow!(
                    "functions.jobs.{} collides with the built-in trial expiration job",
                    name
                ));
            }
            if !is_route_segment(name) {
                return Err(anyhow!(
                    "functions.jobs.{} must only contain lowercase letters, digits, and '-'",
                    name
                ));
            }
            if job.function.trim().is_empty() {
                return Err(anyhow!("functions.jobs.{}.function must not be empty", name));
            }
        }
        Ok(())
    }

    /// Read the service key used when calling the functions host.
    pub fn service_key(&self) -> Option<String> {
        read_secret(&self.service_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardJobConfig {
    /// Function name appended to `functions.base_url`.
    pub function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn read_secret(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        _ => None,
    }
}

fn is_route_segment(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
