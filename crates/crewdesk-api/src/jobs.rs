//! ---
//! cd_section: "05-networking-external-interfaces"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Scheduled trigger endpoints for external schedulers."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use crewdesk_common::config::{FunctionsConfig, TRIAL_EXPIRATION_JOB};
use crewdesk_sweeper::{SweepError, TrialExpirationSweeper};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

/// Fields merged into the success body of a trigger response.
pub type JobOutput = Map<String, Value>;

/// Failures a job reports back to the trigger endpoint.
#[derive(Debug, Error)]
pub enum JobError {
    /// Credentials or settings the job needs are absent.
    #[error("job misconfigured: {0}")]
    Configuration(String),
    /// The system the job drives answered with an error.
    #[error("{message} (status {status})")]
    Downstream {
        /// Status code passed through to the caller.
        status: u16,
        /// Short error text.
        message: String,
        /// Downstream payload or error detail.
        details: Value,
    },
    /// Unexpected failure inside the job itself.
    #[error("job failed: {0}")]
    Internal(String),
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        match self {
            JobError::Configuration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Server configuration error" })),
            )
                .into_response(),
            JobError::Downstream {
                status,
                message,
                details,
            } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (status, Json(json!({ "error": message, "details": details }))).into_response()
            }
            JobError::Internal(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Job failed", "details": details })),
            )
                .into_response(),
        }
    }
}

/// Work an external scheduler can trigger.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    /// Route segment under `/api/cron/`.
    fn name(&self) -> &str;

    /// Verify required credentials before running. Called only for
    /// authenticated requests.
    fn check_ready(&self) -> Result<(), JobError> {
        Ok(())
    }

    /// Execute the job once.
    async fn run(&self) -> Result<JobOutput, JobError>;
}

/// Jobs reachable through the trigger endpoint, keyed by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: IndexMap<String, Arc<dyn ScheduledJob>>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the trial expiration job plus every configured
    /// forwarding job.
    pub fn from_config(
        functions: &FunctionsConfig,
        sweeper: Option<TrialExpirationSweeper>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        if let Some(sweeper) = sweeper {
            registry.register(Arc::new(TrialExpirationJob::new(sweeper)));
        }
        for (name, job) in &functions.jobs {
            let forwarding = ForwardingJob::from_config(name, &job.function, functions)
                .with_context(|| format!("failed to build forwarding job {name}"))?;
            registry.register(Arc::new(forwarding));
        }
        Ok(registry)
    }

    /// Add or replace a job under its own name.
    pub fn register(&mut self, job: Arc<dyn ScheduledJob>) {
        self.jobs.insert(job.name().to_owned(), job);
    }

    /// Look up a job.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScheduledJob>> {
        self.jobs.get(name).cloned()
    }

    /// Registered job names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runs the in-process trial expiration sweep.
#[derive(Debug, Clone)]
pub struct TrialExpirationJob {
    sweeper: TrialExpirationSweeper,
}

impl TrialExpirationJob {
    /// Wrap a sweeper.
    pub fn new(sweeper: TrialExpirationSweeper) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl ScheduledJob for TrialExpirationJob {
    fn name(&self) -> &str {
        TRIAL_EXPIRATION_JOB
    }

    async fn run(&self) -> Result<JobOutput, JobError> {
        let report = self.sweeper.run().await.map_err(|err| match err {
            SweepError::Upstream(store) => JobError::Downstream {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                message: "Tenant store unavailable".into(),
                details: Value::String(store.to_string()),
            },
        })?;
        match serde_json::to_value(report) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(JobError::Internal(format!(
                "unexpected report shape: {other}"
            ))),
            Err(err) => Err(JobError::Internal(err.to_string())),
        }
    }
}

/// Calls a function on the external functions host with the service key.
#[derive(Clone)]
pub struct ForwardingJob {
    name: String,
    function: String,
    base_url: Option<String>,
    service_key: Option<String>,
    client: reqwest::Client,
}

impl ForwardingJob {
    /// Build a job with explicit endpoint and credentials.
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        base_url: Option<String>,
        service_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_owned()),
            service_key,
            client,
        }
    }

    /// Build a job from the `functions` configuration table. The service key
    /// is read from the environment now; a missing key surfaces per request.
    pub fn from_config(name: &str, function: &str, functions: &FunctionsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(functions.timeout)
            .build()
            .context("failed to build functions http client")?;
        Ok(Self::new(
            name,
            function,
            functions.base_url.clone(),
            functions.service_key(),
            client,
        ))
    }

    fn endpoint(&self) -> Option<String> {
        self.base_url
            .as_ref()
            .map(|base| format!("{base}/{}", self.function))
    }
}

impl fmt::Debug for ForwardingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingJob")
            .field("name", &self.name)
            .field("function", &self.function)
            .field("base_url", &self.base_url)
            .field("has_service_key", &self.service_key.is_some())
            .finish()
    }
}

#[async_trait]
impl ScheduledJob for ForwardingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_ready(&self) -> Result<(), JobError> {
        if self.base_url.is_none() {
            return Err(JobError::Configuration("functions.base_url is not set".into()));
        }
        if self.service_key.is_none() {
            return Err(JobError::Configuration("functions service key is not set".into()));
        }
        Ok(())
    }

    async fn run(&self) -> Result<JobOutput, JobError> {
        let (Some(endpoint), Some(key)) = (self.endpoint(), self.service_key.as_ref()) else {
            return Err(JobError::Configuration(format!(
                "job {} is missing its endpoint or key",
                self.name
            )));
        };

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(key)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| {
                warn!(job = %self.name, error = %err, "function request failed");
                JobError::Downstream {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    message: format!("Failed to reach function {}", self.function),
                    details: Value::String(err.to_string()),
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            warn!(job = %self.name, error = %err, "function response could not be read");
            JobError::Downstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message: format!("Failed to read response from function {}", self.function),
                details: Value::String(err.to_string()),
            }
        })?;
        let payload = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        if !status.is_success() {
            warn!(job = %self.name, status = status.as_u16(), "function returned an error");
            return Err(JobError::Downstream {
                status: status.as_u16(),
                message: format!("Function {} failed", self.function),
                details: payload,
            });
        }

        info!(job = %self.name, status = status.as_u16(), "function completed");
        Ok(match payload {
            Value::Object(map) => map,
            Value::String(text) if text.is_empty() => JobOutput::new(),
            other => {
                let mut map = JobOutput::new();
                map.insert("result".into(), other);
                map
            }
        })
    }
}
