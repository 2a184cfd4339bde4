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
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crewdesk_common::metrics::{self, SharedRegistry};
use crewdesk_common::time::{Clock, SystemClock};
use crewdesk_resilience::PollingCircuit;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{presented_secret, secrets_match};
use crate::jobs::{JobOutput, JobRegistry};
use crate::metrics::TriggerMetrics;

const UNKNOWN_JOB_LABEL: &str = "unknown";
const SCHEDULER_LABEL: &str = "scheduler-resume";

/// Shared state behind the trigger routes.
pub struct ApiState {
    cron_secret: Option<String>,
    jobs: JobRegistry,
    circuit: Option<Arc<PollingCircuit>>,
    registry: Option<SharedRegistry>,
    metrics: Option<TriggerMetrics>,
    clock: Arc<dyn Clock>,
}

impl ApiState {
    /// State with the shared secret (if configured) and the job registry.
    pub fn new(cron_secret: Option<String>, jobs: JobRegistry) -> Self {
        Self {
            cron_secret: cron_secret
                .map(|secret| secret.trim().to_owned())
                .filter(|secret| !secret.is_empty()),
            jobs,
            circuit: None,
            registry: None,
            metrics: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for response timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Circuit resumed by `POST /api/scheduler/resume`.
    pub fn with_circuit(mut self, circuit: Arc<PollingCircuit>) -> Self {
        self.circuit = Some(circuit);
        self
    }

    /// Registry exposed at `/metrics`; trigger counters are registered on it.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Result<Self> {
        self.metrics = Some(TriggerMetrics::new(registry.clone())?);
        self.registry = Some(registry);
        Ok(self)
    }

    /// Apply the shared-secret gate. Returns the response to send when the
    /// request must not proceed.
    fn check_secret(&self, uri: &Uri, headers: &HeaderMap) -> Option<ApiError> {
        let Some(expected) = &self.cron_secret else {
            error!("trigger secret is not configured; refusing scheduled trigger");
            return Some(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server configuration error",
            ));
        };
        match presented_secret(uri, headers) {
            Some(presented) if secrets_match(expected, &presented) => None,
            _ => {
                warn!(path = %uri.path(), "scheduled trigger rejected: bad or missing secret");
                Some(ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))
            }
        }
    }

    fn success(&self, mut body: JobOutput) -> Response {
        body.insert("success".into(), Value::Bool(true));
        body.insert(
            "timestamp".into(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        (StatusCode::OK, Json(Value::Object(body))).into_response()
    }

    fn record(&self, label: &str, response: &Response) {
        if let Some(metrics) = &self.metrics {
            metrics.record(label, response.status().as_u16());
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("secret_configured", &self.cron_secret.is_some())
            .field("jobs", &self.jobs)
            .field("circuit", &self.circuit.as_ref().map(|circuit| circuit.name()))
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await the server task.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Routes for scheduled triggers, scheduler control, and metrics.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/cron/:job", post(post_cron))
        .route("/api/scheduler/resume", post(post_scheduler_resume))
        .route("/metrics", get(get_metrics))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve [`router`] until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let app = router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn post_cron(
    State(state): State<Arc<ApiState>>,
    Path(job_name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Some(rejection) = state.check_secret(&uri, &headers) {
        let response = rejection.into_response();
        state.record(UNKNOWN_JOB_LABEL, &response);
        return response;
    }

    let Some(job) = state.jobs.get(&job_name) else {
        let response = ApiError::new(StatusCode::NOT_FOUND, "Not found").into_response();
        state.record(UNKNOWN_JOB_LABEL, &response);
        return response;
    };

    let response = match job.check_ready() {
        Err(err) => {
            error!(job = %job_name, error = %err, "scheduled job is missing configuration");
            err.into_response()
        }
        Ok(()) => {
            info!(job = %job_name, "scheduled job triggered");
            match job.run().await {
                Ok(output) => state.success(output),
                Err(err) => {
                    warn!(job = %job_name, error = %err, "scheduled job failed");
                    err.into_response()
                }
            }
        }
    };
    state.record(&job_name, &response);
    response
}

async fn post_scheduler_resume(
    State(state): State<Arc<ApiState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let response = if let Some(rejection) = state.check_secret(&uri, &headers) {
        rejection.into_response()
    } else if let Some(circuit) = &state.circuit {
        let resumed = circuit.resume();
        let mut body = JobOutput::new();
        body.insert("resumed".into(), Value::Bool(resumed));
        body.insert(
            "state".into(),
            serde_json::to_value(circuit.state()).unwrap_or(Value::Null),
        );
        state.success(body)
    } else {
        ApiError::new(StatusCode::NOT_FOUND, "Not found").into_response()
    };
    state.record(SCHEDULER_LABEL, &response);
    response
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics registry unavailable").into_response();
    };
    match metrics::encode_text(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(metrics::text_content_type()),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> Response {
    ApiError::new(StatusCode::NOT_FOUND, "Not found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobError, ScheduledJob, TrialExpirationJob};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use crewdesk_access::{Company, SubscriptionStatus};
    use crewdesk_common::time::FixedClock;
    use crewdesk_resilience::{PollingPolicy, PollingState};
    use crewdesk_sweeper::{InMemoryTenantStore, TrialExpirationSweeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "cron-s3cret";

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        Unconfigured,
        Downstream,
    }

    struct CountingJob {
        calls: Arc<AtomicUsize>,
        outcome: Outcome,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "send-reminders"
        }

        fn check_ready(&self) -> std::result::Result<(), JobError> {
            match self.outcome {
                Outcome::Unconfigured => Err(JobError::Configuration("no key".into())),
                _ => Ok(()),
            }
        }

        async fn run(&self) -> std::result::Result<JobOutput, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Downstream => Err(JobError::Downstream {
                    status: 429,
                    message: "Function send-reminders failed".into(),
                    details: json!({ "retry_after": 30 }),
                }),
                _ => {
                    let mut output = JobOutput::new();
                    output.insert("sent".into(), json!(4));
                    Ok(output)
                }
            }
        }
    }

    fn state_with(secret: Option<&str>, outcome: Outcome) -> (Arc<ApiState>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut jobs = JobRegistry::new();
        jobs.register(Arc::new(CountingJob {
            calls: calls.clone(),
            outcome,
        }));
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
        let state = ApiState::new(secret.map(str::to_owned), jobs)
            .with_clock(Arc::new(clock))
            .with_metrics_registry(metrics::new_registry())
            .unwrap();
        (Arc::new(state), calls)
    }

    async fn call(state: Arc<ApiState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn trigger(uri: &str) -> axum::http::request::Builder {
        Request::builder().method("POST").uri(uri)
    }

    #[tokio::test]
    async fn wrong_secret_never_reaches_the_job() {
        let (state, calls) = state_with(Some(SECRET), Outcome::Succeed);
        let request = trigger("/api/cron/send-reminders?secret=guess")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state.clone(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Unauthorized" }));

        let request = trigger("/api/cron/send-reminders").body(Body::empty()).unwrap();
        let (status, _) = call(state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_server_secret_is_a_configuration_error() {
        let (state, calls) = state_with(None, Outcome::Succeed);
        let request = trigger("/api/cron/send-reminders")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Server configuration error" }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accepted_secret_sources_run_the_job() {
        let (state, calls) = state_with(Some(SECRET), Outcome::Succeed);
        let requests = [
            trigger(&format!("/api/cron/send-reminders?secret={SECRET}"))
                .body(Body::empty())
                .unwrap(),
            trigger("/api/cron/send-reminders")
                .header("x-cron-secret", SECRET)
                .body(Body::empty())
                .unwrap(),
            trigger("/api/cron/send-reminders")
                .header("authorization", format!("Bearer {SECRET}"))
                .body(Body::empty())
                .unwrap(),
        ];
        for request in requests {
            let (status, body) = call(state.clone(), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
            assert_eq!(body["sent"], 4);
            assert_eq!(body["timestamp"], "2024-05-01T03:00:00+00:00");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_job_credentials_return_500_without_running() {
        let (state, calls) = state_with(Some(SECRET), Outcome::Unconfigured);
        let request = trigger("/api/cron/send-reminders")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Server configuration error");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downstream_status_passes_through() {
        let (state, _) = state_with(Some(SECRET), Outcome::Downstream);
        let request = trigger("/api/cron/send-reminders")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Function send-reminders failed");
        assert_eq!(body["details"]["retry_after"], 30);
    }

    #[tokio::test]
    async fn unknown_jobs_and_routes_are_not_found() {
        let (state, _) = state_with(Some(SECRET), Outcome::Succeed);
        let request = trigger("/api/cron/does-not-exist")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state.clone(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not found" }));

        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let (status, _) = call(state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trial_expiration_job_reports_the_sweep() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let store = InMemoryTenantStore::new();
        store.insert(Company::new_trial(
            "co-1",
            "Acme",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            3,
        ));
        let sweeper = TrialExpirationSweeper::new(
            Arc::new(store.clone()),
            Arc::new(FixedClock::new(now)),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let mut jobs = JobRegistry::new();
        jobs.register(Arc::new(TrialExpirationJob::new(sweeper)));
        let state = Arc::new(ApiState::new(Some(SECRET.into()), jobs));

        let request = trigger("/api/cron/trial-expiration")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 1);
        assert_eq!(body["failed"], 0);
        assert_eq!(
            store.company("co-1").unwrap().subscription_status,
            SubscriptionStatus::Expired
        );
    }

    #[tokio::test]
    async fn resume_endpoint_restarts_a_suspended_circuit() {
        let circuit = Arc::new(PollingCircuit::new(
            "trial-sweep",
            PollingPolicy::new(1, Duration::from_secs(1), Duration::from_secs(1), Duration::ZERO),
            None,
        ));
        circuit.record_failure();
        let state = Arc::new(
            ApiState::new(Some(SECRET.into()), JobRegistry::new()).with_circuit(circuit.clone()),
        );

        let request = trigger("/api/scheduler/resume").body(Body::empty()).unwrap();
        let (status, _) = call(state.clone(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(circuit.is_suspended());

        let request = trigger("/api/scheduler/resume")
            .header("x-cron-secret", SECRET)
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resumed"], true);
        assert_eq!(body["state"]["state"], "polling");
        assert_eq!(circuit.state(), PollingState::Polling);
    }

    #[tokio::test]
    async fn metrics_endpoint_counts_triggers() {
        let (state, _) = state_with(Some(SECRET), Outcome::Succeed);
        let request = trigger("/api/cron/send-reminders?secret=wrong")
            .body(Body::empty())
            .unwrap();
        call(state.clone(), request).await;

        let response = router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("crewdesk_trigger_requests_total{job=\"unknown\",status=\"401\"} 1"));
    }
}
