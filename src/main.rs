//! Flow classifier - end-use classification for completed flow-control missions
//!
//! Listens for completed missions on the backend websocket, aggregates the
//! flowmeter readings for each mission window, predicts the end use with a
//! tree-ensemble model and writes the result back to InfluxDB.
//!
//! Module structure:
//! - `domain/` - Missions, flow aggregates, features, end uses
//! - `io/` - External interfaces (mission stream, InfluxDB, HTTP)
//! - `services/` - Feature derivation, classifier, pipeline
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use flow_classifier::infra::{Config, Metrics};
use flow_classifier::io::{start_http_server, InfluxClient, MissionStream};
use flow_classifier::services::{ClassificationPipeline, Classifier, TreeEnsemble};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// End-use classifier for completed flow-control missions
#[derive(Parser, Debug)]
#[command(name = "flow-classifier", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

/// Map a configured level onto an `EnvFilter` directive
fn filter_directive(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.log_level())));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(project = %config.project_name(), version = %config.version(), "flow-classifier starting");
    info!(
        config_file = %config.config_file(),
        mission_stream = %config.mission_stream_url(),
        influx_url = %config.influx_url(),
        influx_org = %config.influx_org(),
        influx_bucket = %config.influx_bucket(),
        influx_token_set = !config.influx_token().is_empty(),
        influx_timeout_ms = %config.influx_timeout_ms(),
        flowmeter_id = %config.flowmeter_id(),
        model_path = %config.model_path(),
        classes = ?config.classes(),
        bind_address = %config.bind_address(),
        port = %config.server_port(),
        "config_loaded"
    );

    let model = TreeEnsemble::load(config.model_path(), config.classes())
        .with_context(|| format!("Failed to load model {}", config.model_path()))?;
    info!(
        trees = model.num_trees(),
        features = ?model.feature_names(),
        "model_loaded"
    );

    let influx = Arc::new(InfluxClient::new(&config).context("Failed to build InfluxDB client")?);
    let pipeline = Arc::new(
        ClassificationPipeline::new(influx.clone(), Arc::new(model), influx)
            .context("Model features do not match the classifier feature set")?,
    );

    let ip: IpAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid server.bind_address {}", config.bind_address()))?;
    let addr = SocketAddr::new(ip, config.server_port());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Mission stream runs for the process lifetime
    let stream = MissionStream::new(config.mission_stream_url(), pipeline, metrics.clone());
    let stream_shutdown = shutdown_rx.clone();
    let stream_task = tokio::spawn(async move {
        stream.run(stream_shutdown).await;
    });

    // Health and metrics HTTP server
    let http_metrics = metrics.clone();
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = start_http_server(addr, http_metrics, http_shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Periodic metrics summary
    let report_metrics = metrics.clone();
    let report_interval = Duration::from_secs(config.metrics_interval_secs());
    let mut report_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => report_metrics.report().log(),
                _ = report_shutdown.wait_for(|stop| *stop) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    let _ = stream_task.await;
    let _ = http_task.await;
    metrics.report().log();

    info!("flow-classifier shutdown complete");
    Ok(())
}
