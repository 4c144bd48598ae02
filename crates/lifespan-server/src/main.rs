//! lifespan-server: starts the PostgreSQL and Redis pools, keeps them healthy,
//! and drains them on shutdown.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lifespan::backends::{PostgresFactory, RedisFactory};
use lifespan::LifecycleCoordinator;
use lifespan_server::{Settings, load_dotenv};
use lifespan_server::signal::shutdown_signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Lifecycle host for a PostgreSQL pool and a Redis pool.
#[derive(Parser, Debug)]
#[command(name = "lifespan-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Time allowed for in-flight handles to return during shutdown, in milliseconds.
    #[arg(long, env = "LIFESPAN_DRAIN_TIMEOUT_MS", default_value_t = 30_000)]
    drain_timeout_ms: u64,

    /// Interval between background health checks, in seconds. 0 disables them.
    #[arg(long, env = "LIFESPAN_HEALTH_INTERVAL_SECS", default_value_t = 30)]
    health_interval_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Before parsing arguments, so `.env` values also feed the clap defaults.
    let dotenv = load_dotenv();
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match dotenv {
        Ok(Some(path)) => info!(path = %path.display(), "loaded environment file"),
        Ok(None) => debug!("no .env file found"),
        Err(e) => warn!(error = %e, "ignoring .env file"),
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = Settings::from_env().context("failed to load settings")?;
    info!(environment = %settings.environment, "lifespan-server starting");

    let coordinator = Arc::new(LifecycleCoordinator::new());
    coordinator
        .register(
            "postgres",
            PostgresFactory,
            settings
                .database_config()
                .context("invalid PostgreSQL settings")?,
        )
        .context("failed to register PostgreSQL")?;
    coordinator
        .register(
            "redis",
            RedisFactory,
            settings.cache_config().context("invalid Redis settings")?,
        )
        .context("failed to register Redis")?;

    coordinator
        .start_all()
        .await
        .context("startup failed")?;
    info!(
        port = settings.app_port,
        resources = ?coordinator.resource_names(),
        "ready to accept requests"
    );

    let monitor_cancel = CancellationToken::new();
    let monitor = (args.health_interval_secs > 0).then(|| {
        tokio::spawn(health_monitor(
            Arc::clone(&coordinator),
            Duration::from_secs(args.health_interval_secs),
            monitor_cancel.clone(),
        ))
    });

    shutdown_signal()
        .await
        .context("failed to install signal handlers")?;

    monitor_cancel.cancel();
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            warn!(error = %e, "health monitor ended abnormally");
        }
    }

    let drain_timeout = Duration::from_millis(args.drain_timeout_ms);
    info!(?drain_timeout, "shutting down");
    let report = coordinator
        .stop_all(drain_timeout)
        .await
        .context("shutdown failed")?;

    if report.is_forced() {
        warn!(outcomes = ?report.outcomes, "shutdown forced with handles outstanding");
    } else {
        info!("shutdown complete");
    }
    Ok(())
}

/// Health-check every resource on `interval` until `cancel` fires.
async fn health_monitor(
    coordinator: Arc<LifecycleCoordinator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; startup already checked every pool.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = coordinator.health().await;
        for resource in report.unhealthy() {
            warn!(
                resource = %resource.resource,
                state = %resource.state,
                error = resource.error.as_deref().unwrap_or("unknown"),
                "resource unhealthy"
            );
        }
        for resource in report.resources.iter().filter(|r| r.healthy) {
            debug!(
                resource = %resource.resource,
                latency = ?resource.latency,
                "resource healthy"
            );
        }
    }
}
