//! PulseTrail - health-check runner.
//!
//! Runs HTTP, TCP, ping and DNS monitors on their intervals, keeps the set
//! of monitors in step with the configuration store, and raises alerts once
//! a monitor keeps failing.

mod config;
mod db;
mod notify;
mod probe;
mod rule;
mod scheduler;
mod web;

use config::RunnerConfig;
use db::{ConfigStore, Store};
use notify::{Notifier, WebhookNotifier};
use scheduler::{AlertTracker, NetworkProber, Reconciler, ReconcilerOptions, Registry, TaskContext};
use web::{MetricsRegistry, Server};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulsetrail=info".into()),
        )
        .init();

    let cfg = RunnerConfig::load();
    tracing::info!("Starting PulseTrail runner...");
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if let Some(seed) = &cfg.seed_file {
        match store.import_monitors(seed) {
            Ok(n) => tracing::info!("Imported {} monitors from {}", n, seed),
            Err(e) => tracing::warn!("Failed to import monitors from {}: {}", seed, e),
        }
    }

    let notifier: Option<Arc<dyn Notifier>> = match &cfg.alert_webhook_url {
        Some(url) => match WebhookNotifier::new(url.as_str()) {
            Ok(n) => {
                tracing::info!("Alerts will be sent to webhook {}", url);
                Some(Arc::new(n) as Arc<dyn Notifier>)
            }
            Err(e) => {
                tracing::warn!("Alerting disabled, webhook client failed: {}", e);
                None
            }
        },
        None => {
            tracing::info!("No alert webhook configured, alerting disabled");
            None
        }
    };
    let tracker = Arc::new(AlertTracker::new(
        cfg.alert_fail_count,
        cfg.alert_link_baseurl.clone(),
        notifier,
    ));

    let metrics = cfg.metrics_enabled.then(|| Arc::new(MetricsRegistry::new()));

    let ctx = Arc::new(TaskContext {
        prober: Arc::new(NetworkProber),
        sink: store.clone(),
        tracker,
        metrics: metrics.clone(),
        debug: cfg.debug.clone(),
    });

    let registry = Registry::new();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry.clone(),
        ctx,
        ReconcilerOptions {
            poll_interval: cfg.poll_interval,
            force_polling: cfg.use_polling,
            stagger_window: cfg.stagger_window,
        },
    ));

    reconciler.load_initial().await?;

    let shutdown = CancellationToken::new();

    let reconcile_task = {
        let reconciler = reconciler.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { reconciler.run(token).await })
    };

    let web_task = metrics.map(|metrics| {
        let server = Server::new(cfg.metrics_port, registry.clone(), metrics);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(token.cancelled_owned()).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    wait_for_signal().await;
    tracing::info!("Shutting down...");
    shutdown.cancel();

    if let Err(e) = reconcile_task.await {
        tracing::error!("Reconciler task failed: {}", e);
    }
    reconciler.shutdown().await;
    if let Some(task) = web_task {
        if let Err(e) = task.await {
            tracing::error!("Metrics server task failed: {}", e);
        }
    }
    store.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
