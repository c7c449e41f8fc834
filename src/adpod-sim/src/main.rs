//! adpod-sim: replays a CTV pod opportunity through slot planning and pod
//! assembly and prints the outcome as JSON.

mod scenario;

use adpod_core::config::AppConfig;
use adpod_engine::PlannerKind;
use anyhow::Context;
use clap::Parser;
use scenario::{RunOptions, Scenario};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "adpod-sim")]
#[command(about = "Plan and assemble a CTV ad pod from a JSON scenario")]
#[command(version)]
struct Cli {
    /// Scenario file: impression with `video.ext.adpod` plus bidder responses
    scenario: PathBuf,

    /// Slot duration smoothing factor (overrides config)
    #[arg(long, env = "ADPOD__ENGINE__SMOOTHING_FACTOR")]
    smoothing_factor: Option<i64>,

    /// Pod search workers (overrides config)
    #[arg(long, env = "ADPOD__ENGINE__WORKER_COUNT")]
    workers: Option<usize>,

    /// Result collection deadline in milliseconds (overrides config)
    #[arg(long, env = "ADPOD__ENGINE__ASSEMBLY_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Force a planner instead of selecting one from the pod
    #[arg(long, value_parser = parse_planner)]
    planner: Option<PlannerKind>,

    /// Also record timings through the metrics facade and attach the
    /// Prometheus exposition to the report
    #[arg(long, default_value_t = false)]
    prometheus: bool,

    /// Pretty-print the report
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn parse_planner(raw: &str) -> Result<PlannerKind, String> {
    serde_json::from_value(serde_json::Value::String(raw.replace('-', "_")))
        .map_err(|_| format!("unknown planner {raw}, expected maximize_for_duration, min_max or by_duration_ranges"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adpod=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(factor) = cli.smoothing_factor {
        config.engine.smoothing_factor = factor;
    }
    if let Some(workers) = cli.workers {
        config.engine.worker_count = workers;
    }
    if let Some(timeout) = cli.timeout_ms {
        config.engine.assembly_timeout_ms = timeout;
    }

    config.engine.validate()?;

    info!(
        node_id = %config.node_id,
        smoothing_factor = config.engine.smoothing_factor,
        workers = config.engine.worker_count,
        timeout_ms = config.engine.assembly_timeout_ms,
        "Configuration loaded"
    );

    let raw = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading {}", cli.scenario.display()))?;
    let scenario = Scenario::from_json(&raw)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping pod assembly");
            on_signal.cancel();
        }
    });

    let prometheus = if cli.prometheus {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .context("installing metrics recorder")?;
        Some(handle)
    } else {
        None
    };
    let options = RunOptions {
        planner: cli.planner,
        prometheus,
    };

    let report = scenario.run(&config, &options, &cancel).await?;
    let out = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{out}");

    Ok(())
}
