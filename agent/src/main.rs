mod alert;
mod analyzer;
mod gate;
mod monitor;
mod notifier;
mod snapshot;
mod source;

use std::path::PathBuf;

use analyzer::VisionAnalyzer;
use frame_sentinel_common::config::Config;
use monitor::{MonitorSettings, MonitoringLoop};
use notifier::TelegramNotifier;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::from_sources(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = ?config.source.mode,
        interval_secs = config.schedule.interval_secs,
        active_start_hour = config.schedule.active_start_hour,
        active_end_hour = config.schedule.active_end_hour,
        threshold = config.change.threshold,
        model = config.analyzer.model,
        trigger_terms = config.alert.trigger_terms.join(","),
        "starting frame-sentinel"
    );

    let source = match source::open(&config.source).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open frame source");
            std::process::exit(1);
        }
    };
    info!(source = source.name(), "frame source ready");

    let analyzer = match VisionAnalyzer::new(&config.analyzer) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "failed to create vision analyzer");
            std::process::exit(1);
        }
    };

    let notifier = match TelegramNotifier::new(&config.telegram) {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "failed to create Telegram notifier");
            std::process::exit(1);
        }
    };

    let mut monitor = MonitoringLoop::new(
        MonitorSettings::from_config(&config),
        source,
        Box::new(analyzer),
        Box::new(notifier),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested, stopping after current tick"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    monitor.run(shutdown).await;
    info!("frame-sentinel stopped");
}
