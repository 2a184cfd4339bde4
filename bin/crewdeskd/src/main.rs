//! ---
//! cd_section: "02-runtime-orchestration"
//! cd_subsection: "binary"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Binary entrypoint for the CrewDesk daemon."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crewdesk_access::{Company, EntitlementEngine};
use crewdesk_api::auth::secret_fingerprint;
use crewdesk_api::{spawn_api_server, ApiServer, ApiState, JobRegistry};
use crewdesk_common::config::AppConfig;
use crewdesk_common::logging::init_tracing;
use crewdesk_common::metrics::{new_registry, SharedRegistry};
use crewdesk_common::time::{Clock, SystemClock};
use crewdesk_resilience::{PollDirective, PollingCircuit, PollingPolicy, ResilienceMetrics};
use crewdesk_sweeper::{InMemoryTenantStore, SweeperMetrics, TrialExpirationSweeper};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

const SWEEP_CIRCUIT: &str = "trial-expiration-sweep";

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("CrewDesk ", env!("CARGO_PKG_VERSION")),
    about = "CrewDesk entitlement daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "JSON array of company records to load into the tenant store"
    )]
    tenants: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the sweep loop and the trigger API")]
    Run,
    #[command(about = "Run a single trial expiration sweep and print the report")]
    Sweep,
    #[command(about = "Validate configuration and the entitlement tables, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/crewdesk.toml"));
    candidates.push(PathBuf::from("configs/crewdesk.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("crewdeskd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    EntitlementEngine::from_config(&config.access, &config.subscription)
        .context("entitlement tables are invalid")?;
    info!(
        super_admin = config.access.super_admin_email.is_some(),
        trial_days = config.subscription.trial_days,
        "entitlement engine ready"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("Configuration OK: {}", loaded.source.display());
            Ok(())
        }
        Commands::Sweep => {
            let store = load_store(cli.tenants.as_deref())?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let sweeper = TrialExpirationSweeper::from_config(store, clock, &config.sweeper);
            let report = sweeper.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Run => run_daemon(config, cli.tenants.as_deref()).await,
    }
}

async fn run_daemon(config: AppConfig, tenants: Option<&Path>) -> Result<()> {
    let registry: Option<SharedRegistry> = config.metrics.enabled.then(new_registry);
    let store = load_store(tenants)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut sweeper = TrialExpirationSweeper::from_config(store, clock.clone(), &config.sweeper);
    let mut circuit_metrics = None;
    if let Some(registry) = &registry {
        sweeper = sweeper.with_metrics(SweeperMetrics::new(registry.clone())?);
        circuit_metrics = Some(ResilienceMetrics::new(registry.clone())?);
    }
    let circuit = Arc::new(PollingCircuit::new(
        SWEEP_CIRCUIT,
        PollingPolicy::from_config(&config.sweeper.polling),
        circuit_metrics,
    ));

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let secret = config.api.cron_secret();
        match &secret {
            Some(secret) => info!(
                fingerprint = %secret_fingerprint(secret),
                "scheduled trigger secret loaded"
            ),
            None => warn!(
                env = %config.api.cron_secret_env,
                "scheduled trigger secret not set; triggers will be refused"
            ),
        }
        let jobs = JobRegistry::from_config(&config.functions, Some(sweeper.clone()))?;
        info!(jobs = ?jobs.names().collect::<Vec<_>>(), "scheduled jobs registered");

        let mut state = ApiState::new(secret, jobs)
            .with_clock(clock)
            .with_circuit(circuit.clone());
        if let Some(registry) = &registry {
            state = state.with_metrics_registry(registry.clone())?;
        }
        match spawn_api_server(Arc::new(state), config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server started");
                api_server = Some(server);
            }
            Err(err) => warn!(error = %err, "failed to start api server"),
        }
    } else {
        info!("api server disabled by configuration");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_task = if config.sweeper.enabled {
        Some(tokio::spawn(sweep_loop(
            sweeper,
            circuit,
            config.sweeper.interval,
            shutdown_rx,
        )))
    } else {
        info!("in-process sweep loop disabled by configuration");
        None
    };

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(task) = sweep_task {
        task.await.context("sweep loop panicked")?;
    }
    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Periodic sweep driven by the polling circuit. Failures back off and
/// eventually suspend the loop until an operator resumes it.
async fn sweep_loop(
    sweeper: TrialExpirationSweeper,
    circuit: Arc<PollingCircuit>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delay = match sweeper.run().await {
            Ok(_) => {
                circuit.record_success();
                interval
            }
            Err(err) => {
                warn!(error = %err, "scheduled sweep failed");
                match circuit.record_failure() {
                    PollDirective::RetryAfter(delay) => delay,
                    PollDirective::Suspend => {
                        warn!(circuit = %circuit.name(), "sweep loop suspended; awaiting resume");
                        tokio::select! {
                            _ = circuit.wait_resumed() => Duration::ZERO,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("sweep loop stopped");
}

fn load_store(tenants: Option<&Path>) -> Result<Arc<InMemoryTenantStore>> {
    let store = InMemoryTenantStore::new();
    if let Some(path) = tenants {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read tenants file {}", path.display()))?;
        let companies: Vec<Company> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse tenants file {}", path.display()))?;
        info!(count = companies.len(), path = %path.display(), "tenants loaded");
        for company in companies {
            store.insert(company);
        }
    } else {
        warn!("no tenants file given; starting with an empty tenant store");
    }
    Ok(Arc::new(store))
}
