//! Resource Predictor - workload resource usage distribution service
//!
//! Runs as a cluster-wide Deployment: collects usage from the metrics API
//! and Prometheus-compatible backends, keeps a decaying distribution per
//! registered profile and publishes the results to custom resource status.

use anyhow::{Context, Result};
use predict_lib::{
    checkpoint::{CheckpointStore, FileCheckpointStore},
    health::{components, ComponentHealth, HealthRegistry},
    metrics::{MetricsApiSource, MetricsRepository, PrometheusUsageSource, UsageSource},
    observability::StructuredLogger,
    resolver::{KubeClusterSource, WorkloadResolver},
    status::{KubeStatusWriter, StatusPublisher},
    PredictionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const PREDICTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often component health is re-evaluated
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Long-running engine components
struct Engine {
    repository: Arc<MetricsRepository>,
    resolver: Arc<WorkloadResolver>,
    manager: Arc<PredictionManager>,
    publisher: Arc<StatusPublisher>,
}

impl Engine {
    async fn build(
        config: &config::PredictorConfig,
        client: kube::Client,
        health: &HealthRegistry,
    ) -> Result<Self> {
        let mut sources: Vec<Arc<dyn UsageSource>> = Vec::new();
        if config.metrics_api_enabled {
            sources.push(Arc::new(MetricsApiSource::new(client.clone())));
        }
        for backend in &config.prometheus {
            let source = PrometheusUsageSource::new(backend)
                .with_context(|| format!("Invalid Prometheus backend {}", backend.name))?;
            sources.push(Arc::new(source));
        }
        if sources.is_empty() {
            anyhow::bail!("No usage backends configured");
        }
        let repository = Arc::new(MetricsRepository::new(config.repository_config(), sources));

        let resolver_config = config.resolver_config();
        let cluster = Arc::new(KubeClusterSource::new(
            client.clone(),
            resolver_config.extended_kinds.clone(),
        ));
        let resolver = Arc::new(WorkloadResolver::new(resolver_config, cluster));

        let checkpoint_config = config.checkpoint_config();
        match tokio::fs::create_dir_all(&checkpoint_config.directory).await {
            Ok(()) => health.set_healthy(components::CHECKPOINT_STORE).await,
            Err(e) => {
                warn!(
                    directory = %checkpoint_config.directory.display(),
                    error = %e,
                    "Checkpoint directory unavailable"
                );
                health
                    .set_unhealthy(components::CHECKPOINT_STORE, e.to_string())
                    .await;
            }
        }
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(checkpoint_config));

        let manager = Arc::new(PredictionManager::new(
            config.manager_config(),
            Arc::clone(&resolver),
            Arc::clone(&repository),
            checkpoints,
        ));

        let writer = Arc::new(KubeStatusWriter::new(client, &config.status_target));
        let publisher = Arc::new(StatusPublisher::new(
            config.publisher_config(),
            Arc::clone(&manager),
            writer,
        ));

        Ok(Self {
            repository,
            resolver,
            manager,
            publisher,
        })
    }

    fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            self.repository.start(shutdown),
            self.resolver.start(shutdown),
            self.manager.start(shutdown),
            self.publisher.start(shutdown),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting resource-predictor");

    let config = config::PredictorConfig::load()?;
    info!(
        api_port = config.api_port,
        backends = config.prometheus.len(),
        static_profiles = config.profiles.len(),
        "Predictor configured"
    );

    let logger = StructuredLogger::new("resource-predictor");
    logger.log_startup(PREDICTOR_VERSION);

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    let engine = match kube::Client::try_default().await {
        Ok(client) => build_engine(&config, client, &health_registry).await,
        Err(e) => {
            warn!(error = %e, "Failed to create Kubernetes client, serving health endpoints only");
            for name in [components::WORKLOAD_RESOLVER, components::PREDICTION_MANAGER] {
                health_registry.set_unhealthy(name, e.to_string()).await;
            }
            None
        }
    };

    if let Some(engine) = &engine {
        handles.extend(engine.start(&shutdown_tx));
        handles.push(tokio::spawn(watch_health(
            Arc::clone(&engine.repository),
            Arc::clone(&engine.resolver),
            Arc::clone(&engine.manager),
            Arc::clone(&engine.publisher),
            health_registry.clone(),
            shutdown_tx.subscribe(),
        )));
        if !config.profiles.is_empty() {
            handles.push(tokio::spawn(register_static_profiles(
                Arc::clone(&engine.manager),
                config.clone(),
                shutdown_tx.subscribe(),
            )));
        }
    }

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        engine.as_ref().map(|e| Arc::clone(&e.manager)),
    ));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task panicked");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the engine. On failure the manager never starts and the API keeps
/// answering health checks.
async fn build_engine(
    config: &config::PredictorConfig,
    client: kube::Client,
    health: &HealthRegistry,
) -> Option<Engine> {
    match Engine::build(config, client, health).await {
        Ok(engine) => Some(engine),
        Err(e) => {
            warn!(error = %e, "Failed to build prediction engine, serving health endpoints only");
            health
                .set_unhealthy(components::PREDICTION_MANAGER, format!("{e:#}"))
                .await;
            None
        }
    }
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT received")
            }
            _ = terminate.recv() => Ok("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok("ctrl-c received")
    }
}

/// Mirror engine state into the health registry
async fn watch_health(
    repository: Arc<MetricsRepository>,
    resolver: Arc<WorkloadResolver>,
    manager: Arc<PredictionManager>,
    publisher: Arc<StatusPublisher>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let caches: Vec<_> = repository.status().await.into_iter().map(|(_, s)| s).collect();
                health
                    .update(components::METRICS_REPOSITORY, ComponentHealth::from_caches(&caches))
                    .await;
                health
                    .update(
                        components::WORKLOAD_RESOLVER,
                        ComponentHealth::from_caches(&[resolver.status().await]),
                    )
                    .await;

                let started = manager.started();
                if started {
                    health.set_healthy(components::PREDICTION_MANAGER).await;
                } else {
                    health
                        .set_degraded(components::PREDICTION_MANAGER, "waiting for backends to sync")
                        .await;
                }
                health.set_ready(started).await;

                match publisher.last_summary().await {
                    Some(summary) if summary.failed > 0 && summary.written == 0 => {
                        health
                            .set_degraded(
                                components::STATUS_PUBLISHER,
                                format!("{} status writes failed", summary.failed),
                            )
                            .await;
                    }
                    _ => health.set_healthy(components::STATUS_PUBLISHER).await,
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Register configured profiles once the manager accepts registrations
async fn register_static_profiles(
    manager: Arc<PredictionManager>,
    config: config::PredictorConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if manager.started() {
                    break;
                }
            }
            _ = shutdown.recv() => return,
        }
    }

    let backends = config.prometheus_sources();
    for profile in &config.profiles {
        let (key, spec) = profile.resolve(&backends);
        if let Err(e) = manager.register(key.clone(), spec).await {
            warn!(profile = %key, error = %e, "Failed to register static profile");
        }
    }
    info!(count = config.profiles.len(), "Static profiles registered");
}
