use aegis_gateway::anomaly::{DetectionEngine, FeatureEvent};
use aegis_gateway::config::GatewayConfig;
use aegis_gateway::logging::{init_logging, LogConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Aegis API gateway anomaly detection engine
#[derive(Debug, Parser)]
#[command(name = "aegis-gateway", version, about)]
struct Cli {
    /// 設定ファイル（TOML）
    #[arg(short, long, env = "AEGIS_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// 起動時に投入する特徴イベント（JSON Lines）
    #[arg(long)]
    replay: Option<PathBuf>,

    /// ログレベル（設定ファイルより優先）
    #[arg(long)]
    log_level: Option<String>,

    /// 検知済み異常を回収する間隔（秒）
    #[arg(long, default_value_t = 5)]
    drain_interval: u64,

    /// サンプル設定を出力して終了
    #[arg(long)]
    print_sample_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_sample_config {
        print!("{}", GatewayConfig::sample_toml()?);
        return Ok(());
    }

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let mut log_config = LogConfig::from_settings(&config.log);
    if let Some(level) = &cli.log_level {
        log_config = log_config.with_level(level.clone());
    }
    let _log_guard = init_logging(&log_config)?;

    info!("Starting aegis-gateway v{}", env!("CARGO_PKG_VERSION"));
    let engine =
        DetectionEngine::start(config.detection.clone()).context("Failed to start detection engine")?;

    if let Some(path) = &cli.replay {
        let events = read_replay(path).await?;
        info!("Replaying {} feature events from {}", events.len(), path.display());
        engine.stream().seed(events);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.drain_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
            _ = ticker.tick() => drain(&engine),
        }
    }

    let processed = engine.shutdown().await?;
    info!("Shutdown complete ({} events processed)", processed);
    Ok(())
}

/// インシデント集約の代わりに、溜まった異常をログへ出力
fn drain(engine: &DetectionEngine) {
    let anomalies = engine.sink().drain();
    if anomalies.is_empty() {
        return;
    }
    for anomaly in &anomalies {
        info!(
            "Incident candidate: {} client={} route={} status={} at {}",
            anomaly.reason,
            anomaly.event.client_key(),
            anomaly.event.route_key,
            anomaly.event.status,
            anomaly.detected_at
        );
    }
    let stats = engine.sink().stats();
    info!(
        "Drained {} anomalies (observed: {}, total anomalies: {})",
        anomalies.len(),
        stats.total_observed,
        stats.total_anomalies
    );
    if let Some(ml) = engine.ml() {
        let status = ml.status();
        info!(
            "ML detector: {:?} threshold={:?} baseline={}",
            status.phase, status.threshold, status.baseline_len
        );
    }
}

async fn read_replay(path: &Path) -> Result<Vec<FeatureEvent>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read replay file {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<FeatureEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping replay line {}: {}", index + 1, e),
        }
    }
    Ok(events)
}
