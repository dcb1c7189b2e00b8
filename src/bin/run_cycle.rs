//! Manual alert cycle
//!
//! Runs one weather alert cycle for an arbitrary origin and prints the cycle
//! report as JSON. Uses the same config, collaborators and metrics as the
//! daemon, so it is a direct way to check thresholds, radius and push wiring.
//!
//! Usage:
//!   cargo run --bin run-cycle -- --lat 45.50 --lon -73.60 --radius-km 30
//!   cargo run --bin run-cycle -- --site montreal

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use well_alerts::infra::{Config, Metrics};
use well_alerts::io::{HttpPushProvider, JsonFileDirectory, OpenWeatherProvider};
use well_alerts::services::{AlertPipeline, AlertScheduler, RunOutcome};

#[derive(Parser, Debug)]
#[command(name = "run-cycle", about = "Run one weather alert cycle and print the report")]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Configured site id (overrides --lat/--lon)
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    site: Option<String>,

    #[arg(long, allow_hyphen_values = true, required_unless_present = "site")]
    lat: Option<f64>,

    #[arg(long, allow_hyphen_values = true, required_unless_present = "site")]
    lon: Option<f64>,

    /// Defaults to scheduler.default_radius_km
    #[arg(long)]
    radius_km: Option<f64>,

    /// Override the users snapshot file
    #[arg(long)]
    users: Option<String>,

    /// Print the metrics summary after the run
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the JSON report
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let weather = Arc::new(OpenWeatherProvider::from_config(&config)?);
    let push = Arc::new(HttpPushProvider::from_config(&config)?);
    let users = args.users.as_deref().unwrap_or(config.directory_snapshot_file()).to_string();
    let directory = Arc::new(JsonFileDirectory::new(users));
    let metrics = Arc::new(Metrics::new());

    let pipeline =
        Arc::new(AlertPipeline::from_config(&config, weather, push, directory, metrics.clone()));

    let report = match &args.site {
        Some(site_id) => {
            // Same in-flight guard as the daemon's scheduler
            let scheduler =
                AlertScheduler::new(pipeline, config.sites().to_vec(), config.scheduler_interval());
            match scheduler.trigger(site_id).await? {
                RunOutcome::Completed(report) => report,
                RunOutcome::Skipped => anyhow::bail!("site {site_id} already running"),
            }
        }
        None => {
            let lat = args.lat.context("--lat is required")?;
            let lon = args.lon.context("--lon is required")?;
            let radius_km = args.radius_km.unwrap_or(config.default_radius_km());
            pipeline.run_at(lat, lon, radius_km).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        metrics.report().log();
    }
    Ok(())
}
