//! Process entry point: startup contract (spec §6), component wiring, and
//! the shutdown sequence (spec §4.I).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetd::config::{ConfigStore, FleetConfig};
use fleetd::context::{Clock, ShutdownContext, SystemClock};
use fleetd::db::pg::PgStorage;
use fleetd::db::Storage;
use fleetd::health::{EnabledProbes, HealthChecker};
use fleetd::registry::Registry;
use fleetd::shutdown::LifecycleManager;
use fleetd::tasks::TaskEngine;
use fleetd::traffic::{Collector, Limiter};
use fleetd::transport::{HttpsTransports, SshPool};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SSH_IDLE_TTL: Duration = Duration::from_secs(10 * 60);
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    if let Err(e) = check_startup_contract() {
        error!(error = %e, "startup contract violated");
        std::process::exit(1);
    }

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config.yaml");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn Storage> = match PgStorage::connect(&config.db_url) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown = ShutdownContext::new();

    let ssh_pool = Arc::new(SshPool::new(SSH_IDLE_TTL, SSH_CONNECT_TIMEOUT));
    ssh_pool.spawn_idle_sweeper(shutdown.child_token());
    let https = Arc::new(HttpsTransports::new());

    let registry = Arc::new(Registry::new(storage.clone(), ssh_pool.clone(), https.clone(), clock.clone(), shutdown.clone()));
    if let Err(e) = registry.refresh().await {
        warn!(error = %e, "initial provider registry load failed, starting with an empty set");
    }

    let config_store = Arc::new(ConfigStore::new(storage.clone(), config.clone()));
    config_store.on_change(|cfg| info!(env = %cfg.system.env, "config reloaded"));
    if let Err(e) = config_store.reload().await {
        warn!(error = %e, "initial dynamic config load failed, running on config.yaml defaults only");
    }

    let task_engine = TaskEngine::new(storage.clone(), registry.clone(), clock.clone(), shutdown.clone());
    let task_handle = task_engine.spawn();

    let limiter = Arc::new(Limiter::new(storage.clone(), task_engine.clone()));
    let collector = Collector::new(storage.clone(), registry.clone(), clock.clone(), shutdown.clone(), limiter);
    let monitoring_handle = collector.spawn();

    let health_handle = spawn_health_scheduler(storage.clone(), ssh_pool.clone(), https.clone(), shutdown.clone());
    let registry_refresh_handle = spawn_registry_refresher(registry.clone(), shutdown.clone());

    let listener = match TcpListener::bind(&config.system.addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.system.addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(addr = %config.system.addr, "listening");

    let mut manager = LifecycleManager::new(shutdown.clone(), SHUTDOWN_STEP_TIMEOUT);
    // Registered in the reverse of the spec's shutdown order, so walking
    // `manager.steps` forward at shutdown time reproduces that order
    // exactly (task scheduler first, database last).
    manager.register_database(move || async move {
        drop(storage);
    });
    manager.register_https_transports(https);
    manager.register_ssh_pool(ssh_pool);
    manager.register_provider_cache(registry);
    manager.register_health_scheduler(health_handle);
    manager.register_monitoring_scheduler(monitoring_handle);
    manager.register_task_scheduler(task_handle);
    drop(registry_refresh_handle); // folded into the registry cache's own shutdown

    tokio::select! {
        _ = accept_loop(listener, shutdown.clone()) => {}
        _ = wait_for_signal() => {
            info!("shutdown signal received");
        }
    }

    manager.shutdown().await;
}

fn check_startup_contract() -> Result<(), String> {
    if !Path::new("config.yaml").is_file() {
        return Err("config.yaml not found in working directory".into());
    }
    let storage_dir = Path::new("storage");
    std::fs::create_dir_all(storage_dir).map_err(|e| format!("storage/ not writable: {e}"))?;
    let probe = storage_dir.join(".write_probe");
    std::fs::write(&probe, b"ok").map_err(|e| format!("storage/ not writable: {e}"))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn load_config() -> Result<FleetConfig, String> {
    let raw = std::fs::read_to_string("config.yaml").map_err(|e| e.to_string())?;
    FleetConfig::load_from_str(&raw).map_err(|e| e.to_string())
}

/// Runs a health check against every registered provider on a fixed period,
/// storing the serialized report on the provider row (spec §4.B). Status
/// mapping: a healthy or partial report keeps the provider `active`
/// (partial results are still usable, spec §4.B); an unhealthy or
/// indeterminate one demotes it to `partial` rather than flipping it
/// `inactive` outright, since that's an administrative decision, not
/// something a health probe should make unilaterally.
fn spawn_health_scheduler(
    storage: Arc<dyn Storage>,
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
    shutdown: ShutdownContext,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let checker = HealthChecker::new(ssh_pool, https);
        let mut tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => run_health_pass(&storage, &checker).await,
            }
        }
    })
}

async fn run_health_pass(storage: &Arc<dyn Storage>, checker: &HealthChecker) {
    let providers = match storage.list_providers().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to list providers for health check");
            return;
        }
    };
    for mut provider in providers {
        if !provider.should_be_registered(chrono::Utc::now()) {
            continue;
        }
        let enabled = EnabledProbes::for_provider_type(provider.provider_type);
        let report = checker.check(&provider, enabled).await;
        let report_json = serde_json::to_string(&report).unwrap_or_default();
        provider.last_health_result = Some(report_json);
        provider.status = match report.status {
            fleetd::health::HealthStatus::Healthy | fleetd::health::HealthStatus::Partial => {
                fleetd::db::models::ProviderStatus::Active
            }
            fleetd::health::HealthStatus::Unhealthy | fleetd::health::HealthStatus::Unknown => {
                fleetd::db::models::ProviderStatus::Partial
            }
        };
        if let Err(e) = storage.update_provider(provider).await {
            warn!(error = %e, "failed to persist health result");
        }
    }
}

fn spawn_registry_refresher(registry: Arc<Registry>, shutdown: ShutdownContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REGISTRY_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = registry.refresh().await {
                        warn!(error = %e, "periodic registry refresh failed");
                    }
                }
            }
        }
    })
}

async fn accept_loop(listener: TcpListener, shutdown: ShutdownContext) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((_stream, peer)) => info!(%peer, "accepted connection"),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
