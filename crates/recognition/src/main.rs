//! Multi-camera plate recognition service.
//!
//! Usage:
//!   lpr-pipeline --camera entry=/data/entry --camera exit=/data/exit \
//!                --calibration calibration.json --config pipeline.json

use anyhow::{bail, Context, Result};
use clap::Parser;
use recognition::{
    source::FrameSource, spawn_camera_worker, worker::run_clock_sync, CacheHealthMonitor,
    CameraSyncManager, CorrelationLoop, CrossCameraCorrelator, DirectoryFrameSource,
    HomographyCalculator, PipelineConfig, RecognitionPipeline,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "lpr-pipeline")]
#[command(about = "License plate recognition across synchronized cameras", long_about = None)]
struct Cli {
    /// Pipeline configuration file (JSON)
    #[arg(long, env = "LPR_CONFIG")]
    config: Option<PathBuf>,

    /// Camera as `id=directory`; repeat for each camera
    #[arg(long = "camera", value_parser = parse_camera, required = true)]
    cameras: Vec<(String, PathBuf)>,

    /// Calibration points file (JSON)
    #[arg(long, env = "LPR_CALIBRATION")]
    calibration: Option<PathBuf>,

    /// Restart each camera directory when it runs out of frames
    #[arg(long = "loop")]
    looping: bool,

    /// Milliseconds between frame reads per camera
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Seconds between track expiry passes
    #[arg(long, default_value_t = 5)]
    cleanup_interval_secs: u64,

    /// Use the local clock instead of time servers
    #[arg(long)]
    no_time_sync: bool,
}

fn parse_camera(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((id, dir)) if !id.trim().is_empty() && !dir.trim().is_empty() => {
            Ok((id.trim().to_string(), PathBuf::from(dir.trim())))
        }
        _ => Err(format!("expected id=directory, got '{}'", value)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = telemetry::init_with_service("lpr-pipeline");

    let config = PipelineConfig::load(cli.config.as_deref())?;
    info!(
        cameras = cli.cameras.len(),
        ocr_method = ?config.ocr_method,
        region = %config.regional.country_code,
        "starting plate recognition"
    );

    let mut seen = std::collections::HashSet::new();
    for (id, _) in &cli.cameras {
        if !seen.insert(id.as_str()) {
            bail!("camera '{}' given more than once", id);
        }
    }

    let mut sync_config = config.camera_sync.clone();
    if cli.no_time_sync {
        // Local clock only; camera offsets are still estimated against it
        sync_config.ntp_servers.clear();
    }
    let sync = Arc::new(CameraSyncManager::new(
        sync_config,
        config.performance.enable_buffer_prealloc,
    ));
    if !cli.no_time_sync {
        let initial = Arc::clone(&sync);
        match tokio::task::spawn_blocking(move || initial.sync_time()).await? {
            Ok(offset) => info!(offset, "clock synchronized"),
            Err(e) => warn!(error = %e, "initial clock synchronization failed, using local clock"),
        }
    }

    let homography = Arc::new(HomographyCalculator::new());
    if let Some(path) = &cli.calibration {
        let cameras = homography
            .load_calibration_file(path)
            .with_context(|| format!("Failed to load calibration {}", path.display()))?;
        info!(cameras, "calibration loaded");
    }
    let correlator = Arc::new(CrossCameraCorrelator::new(
        homography,
        config.tracking.max_correlation_distance,
        config.tracking.min_correlation_frames,
    ));

    let pipeline = Arc::new(RecognitionPipeline::new(config.clone())?);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if let Some(cache) = pipeline.cache() {
        let monitor = CacheHealthMonitor::new(
            Arc::clone(cache),
            Duration::from_secs(config.cache.health_check_interval_secs),
        );
        tasks.push(tokio::spawn(monitor.run(cancel.child_token())));
    }
    if !cli.no_time_sync {
        tasks.push(tokio::spawn(run_clock_sync(
            Arc::clone(&sync),
            cancel.child_token(),
        )));
    }

    let (events_tx, events_rx) = mpsc::channel(cli.cameras.len().max(1) * 8);
    let poll_interval = Duration::from_millis(cli.poll_interval_ms.max(1));
    for (id, dir) in cli.cameras {
        let source: Box<dyn FrameSource> =
            Box::new(DirectoryFrameSource::new(id, dir, cli.looping));
        tasks.push(spawn_camera_worker(
            source,
            Arc::clone(&pipeline),
            Arc::clone(&sync),
            events_tx.clone(),
            poll_interval,
            cancel.child_token(),
        ));
    }
    // The loop ends on its own once every worker has dropped its sender
    drop(events_tx);

    let correlation =
        CorrelationLoop::new(correlator, Arc::clone(pipeline.tracker()), Arc::clone(&sync));
    let mut correlation_task = tokio::spawn(correlation.run(
        events_rx,
        Duration::from_secs(cli.cleanup_interval_secs.max(1)),
        cancel.child_token(),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            info!("received Ctrl+C, shutting down");
        }
        _ = &mut correlation_task => {
            info!("all camera streams finished");
        }
    }

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task ended abnormally");
        }
    }
    if !correlation_task.is_finished() {
        if let Err(e) = correlation_task.await {
            error!(error = %e, "correlation loop ended abnormally");
        }
    }

    let stats = pipeline.stats();
    info!(
        frames = stats.frames_processed,
        skipped = stats.frames_skipped,
        accepted = stats.plates_accepted,
        review = stats.plates_for_review,
        rejected = stats.plates_rejected,
        tracks = pipeline.tracker().len(),
        "pipeline stopped"
    );
    match telemetry::encode_metrics() {
        Ok(text) => info!(metrics = %text, "final metrics"),
        Err(e) => warn!(error = %e, "failed to encode metrics"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera() {
        assert_eq!(
            parse_camera("gate=/data/gate").unwrap(),
            ("gate".to_string(), PathBuf::from("/data/gate"))
        );
        assert!(parse_camera("gate").is_err());
        assert!(parse_camera("=dir").is_err());
        assert!(parse_camera("gate=").is_err());
    }

    #[test]
    fn test_cli_parses_repeated_cameras() {
        let cli = Cli::try_parse_from([
            "lpr-pipeline",
            "--camera",
            "a=/tmp/a",
            "--camera",
            "b=/tmp/b",
            "--loop",
        ])
        .unwrap();
        assert_eq!(cli.cameras.len(), 2);
        assert!(cli.looping);
        assert_eq!(cli.poll_interval_ms, 100);
    }
}
