//! Well alerts - weather alert notification service
//!
//! Periodically fetches forecasts for configured sites, evaluates alert
//! thresholds and pushes notifications to opted-in users nearby.
//!
//! Module structure:
//! - `domain/` - Core types (locations, forecasts, alerts, dispatch results)
//! - `io/` - External interfaces (weather API, push gateway, user directory, HTTP)
//! - `services/` - Business logic (cache, evaluator, audience, dispatcher, scheduler)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use well_alerts::infra::{Config, Metrics};
use well_alerts::io::{HttpPushProvider, JsonFileDirectory, OpenWeatherProvider};
use well_alerts::services::{AlertPipeline, AlertScheduler, WeatherCache};

/// Well alerts - weather alert notification service
#[derive(Parser, Debug)]
#[command(name = "well-alerts", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "well-alerts starting");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    info!(
        config_file = %config.config_file(),
        service_id = %config.service_id(),
        weather_base_url = %config.weather_base_url(),
        cache_ttl_secs = %config.cache_ttl().as_secs(),
        push_chunk_size = %config.push_chunk_size(),
        push_max_concurrent_chunks = %config.push_max_concurrent_chunks(),
        directory = %config.directory_snapshot_file(),
        sites = %config.sites().len(),
        scheduler_interval_secs = %config.scheduler_interval().as_secs(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Collaborators: missing credentials are fatal at startup
    let weather = Arc::new(
        OpenWeatherProvider::from_config(&config).context("weather provider setup failed")?,
    );
    let push =
        Arc::new(HttpPushProvider::from_config(&config).context("push provider setup failed")?);
    let directory = Arc::new(JsonFileDirectory::new(config.directory_snapshot_file()));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let pipeline =
        Arc::new(AlertPipeline::from_config(&config, weather, push, directory, metrics.clone()));

    // Start cache sweeper
    let sweeper = WeatherCache::spawn_sweeper(
        pipeline.cache().clone(),
        config.cache_sweep_interval(),
        shutdown_rx.clone(),
    );

    let scheduler = Arc::new(AlertScheduler::new(
        pipeline.clone(),
        config.sites().to_vec(),
        config.scheduler_interval(),
    ));

    // Start Prometheus metrics / trigger HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_scheduler = Some(scheduler.clone());
        let prom_shutdown = shutdown_rx.clone();
        let service_id = config.service_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = well_alerts::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                service_id,
                prom_scheduler,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    if config.sites().is_empty() {
        info!("no_sites_configured");
    }

    // Run scheduler - ticks until shutdown, then drains in-flight cycles
    scheduler.run(shutdown_rx).await;

    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "weather_cache_sweeper_join_failed");
    }
    pipeline.cache().close();
    metrics.report().log();

    info!("well-alerts shutdown complete");
    Ok(())
}
