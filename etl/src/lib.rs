use anyhow::Context;
use common::config::Settings;
use lakehouse::services::PipelineService;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_CONFIG_PATH: &str = "config/etl.toml";

/// One invocation of the pipeline, as chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtlCommand {
    Ingest { rebuild: bool, refresh_stations: bool },
    Stations,
    Summaries,
    Run { rebuild: bool },
}

/// Human-readable logs on stderr by default, JSON lines when `json` is set.
/// `RUST_LOG` overrides the `info` default.
pub fn init_logging(json: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let pretty = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });
    let structured = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(pretty)
        .with(structured)
        .init();
}

pub fn json_logs_from_env() -> bool {
    std::env::var("CABI_LOG_JSON")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn print_report<T: Serialize>(report: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

pub async fn run_command(config_path: &str, command: EtlCommand) -> anyhow::Result<()> {
    let settings = Settings::new(config_path)
        .with_context(|| format!("failed to load settings from {}", config_path))?;
    let service = PipelineService::new(&settings)
        .await
        .context("failed to configure storage")?;

    info!(?command, config = config_path, "Running pipeline command");

    match command {
        EtlCommand::Ingest {
            rebuild,
            refresh_stations,
        } => {
            let report = service.run_ingest(rebuild, refresh_stations).await?;
            print_report(&report)?;
        }
        EtlCommand::Stations => {
            let stations = service.rebuild_stations().await?;
            print_report(&serde_json::json!({ "stations": stations }))?;
        }
        EtlCommand::Summaries => {
            let report = service.build_summaries().await?;
            print_report(&report)?;
        }
        EtlCommand::Run { rebuild } => {
            let ingest = service.run_ingest(rebuild, false).await?;
            let summaries = service.build_summaries().await?;
            print_report(&serde_json::json!({ "ingest": ingest, "summaries": summaries }))?;
        }
    }

    Ok(())
}
