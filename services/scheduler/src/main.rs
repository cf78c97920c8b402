//! drover scheduler
//!
//! Subscribes to the cluster resource manager as a framework and drives
//! every workload to convergence.

use std::sync::Arc;

use anyhow::Result;
use drover_scheduler::{
    clock::{SharedClock, SystemClock},
    config::Config,
    driver::HttpDriver,
    notify::{LogEndpoints, Notifier, WebhookAlerter},
    store::MemoryStore,
    Context, Scheduler,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DROVER_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drover scheduler");
    info!(
        cluster_id = %config.cluster.cluster_id,
        masters = ?config.cluster.master_urls,
        "Configuration loaded"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let notifier = match &config.alert_webhook_url {
        Some(url) => {
            info!(url = %url, "Alerts go to webhook");
            Notifier::new(
                Arc::new(WebhookAlerter::new(url.clone())?),
                Arc::new(LogEndpoints),
                clock.clone(),
            )
        }
        None => Notifier::logging(clock.clone()),
    };
    let driver = Arc::new(HttpDriver::new(config.cluster.master_urls.clone())?);
    let store = Arc::new(MemoryStore::new());

    let ctx = Context::new(config, store, driver, notifier, clock);
    let scheduler = Scheduler::new(ctx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut handle => {
            match result {
                Ok(Ok(())) => info!("Scheduler exited"),
                Ok(Err(e)) => error!(error = %e, "Scheduler failed"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Scheduler failed during shutdown"),
        Err(e) => error!(error = %e, "Scheduler task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}
