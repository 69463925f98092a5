//! Training VM provisioner
//!
//! Runs the lifecycle reconcilers for the configured intake paths, the
//! propagation bridge and the garbage collector against the declarative
//! store, each under a supervisor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trainvm_provisioner::{
    backend::{BackendProvider, Backends, ElasticProvider, LivenessProbe, StaticPoolProvider, TcpProbe},
    bridge::PropagationBridge,
    cleanup::GarbageCollector,
    config::Config,
    model::RequestSource,
    provision::{CommandProvisioner, ConfigResolver, DefaultConfigResolver, Provisioner},
    reconciler::LifecycleReconciler,
    store::{Api, HttpStore, StateStore},
    supervisor::{supervise, RestartPolicy, SupervisorExit},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TRAINVM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting training VM provisioner");
    if let Some(unknown) = &config.unknown_integration_mode {
        warn!(value = %unknown, "Unknown integration mode, falling back to hybrid");
    }
    info!(
        mode = ?config.integration_mode,
        store_url = %config.store_url,
        static_pool = ?config.static_pool,
        elastic_enabled = config.elastic.is_some(),
        "Configuration loaded"
    );

    let store: Arc<dyn StateStore> = Arc::new(HttpStore::new(
        config.store_url.clone(),
        config.store_token.clone(),
    )?);
    let requests = Api::requests(store.clone(), &config.request_namespace);

    let probe: Arc<dyn LivenessProbe> = Arc::new(TcpProbe::new(config.probe_port));
    let static_pool: Arc<dyn BackendProvider> =
        Arc::new(StaticPoolProvider::new(config.static_pool.clone(), probe.clone()));
    let elastic = config.elastic.clone().map(|template| {
        Arc::new(ElasticProvider::new(
            Api::instances(store.clone()),
            template,
            probe.clone(),
        ))
    });
    let backends = Backends::new(
        static_pool,
        elastic
            .clone()
            .map(|e| e as Arc<dyn BackendProvider>),
    );

    let provisioner: Arc<dyn Provisioner> = Arc::new(CommandProvisioner::new(
        config.provision_command.clone(),
        config.job_dir.clone(),
        config.probe_port,
    ));
    let resolver: Arc<dyn ConfigResolver> = Arc::new(DefaultConfigResolver);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<(&'static str, JoinHandle<SupervisorExit>)> = Vec::new();

    let mut sources = Vec::new();
    if config.integration_mode.runs_platform() {
        sources.push((RequestSource::Platform, "platform-reconciler"));
    }
    if config.integration_mode.runs_broker() {
        sources.push((RequestSource::Broker, "broker-reconciler"));
    }

    for (source, name) in sources {
        let requests = requests.clone();
        let backends = backends.clone();
        let provisioner = provisioner.clone();
        let resolver = resolver.clone();
        let expiry = config.expiry;
        let handle = tokio::spawn(supervise(
            name,
            config.reconcile_interval,
            RestartPolicy::default(),
            shutdown_rx.clone(),
            move || {
                LifecycleReconciler::new(
                    source,
                    requests.clone(),
                    backends.clone(),
                    provisioner.clone(),
                    resolver.clone(),
                    expiry,
                )
            },
        ));
        handles.push((name, handle));
    }

    if config.integration_mode.runs_platform() {
        let requests = requests.clone();
        let machines = Api::machines(store.clone(), &config.platform_namespace);
        let secret_name = config.ssh_secret_name.clone();
        let handle = tokio::spawn(supervise(
            "propagation-bridge",
            config.reconcile_interval,
            RestartPolicy::default(),
            shutdown_rx.clone(),
            move || PropagationBridge::new(requests.clone(), machines.clone(), secret_name.clone()),
        ));
        handles.push(("propagation-bridge", handle));
    }

    {
        let requests = requests.clone();
        let elastic = elastic.clone();
        let expiry = config.expiry;
        let handle = tokio::spawn(supervise(
            "garbage-collector",
            config.cleanup_interval,
            RestartPolicy::default(),
            shutdown_rx.clone(),
            move || GarbageCollector::new(requests.clone(), elastic.clone(), expiry),
        ));
        handles.push(("garbage-collector", handle));
    }

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    // Wait for loops to finish their current pass
    info!("Waiting for loops to shut down...");
    let shutdown_timeout = Duration::from_secs(30);

    for (name, handle) in handles {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(exit)) => info!(worker = name, exit = ?exit, "Loop stopped"),
            Ok(Err(e)) => error!(worker = name, error = %e, "Supervisor task panicked"),
            Err(_) => warn!(worker = name, "Loop did not shut down in time"),
        }
    }

    info!("Provisioner shutdown complete");
    Ok(())
}
