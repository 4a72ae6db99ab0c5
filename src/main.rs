// src/main.rs
//
// Edge runner: detection frames arrive as JSONL on stdin, occupancy changes
// are committed locally and relayed to the ingest endpoint in the
// background.
//
// Threads:
//   frame thread   stdin → OccupancyPipeline (blocking, no network)
//   tokio runtime  DeliveryWorker, ctrl-c

use anyhow::{Context, Result};
use lot_occupancy_edge::config::{Config, StatusConfig};
use lot_occupancy_edge::input::{parse_frame_line, FrameLines};
use lot_occupancy_edge::pipeline::{OccupancyPipeline, PipelineEvent, PipelineMetrics};
use lot_occupancy_edge::relay::{DeliverySettings, DeliveryWorker, HttpTransport, Outbox};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "edge_config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDGE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config_path = PathBuf::from(config_path);

    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    config.apply_env_overrides();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "lot_occupancy_edge={},reqwest=warn,hyper=warn",
            config.logging.level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🅿️  Lot occupancy edge counter starting");
    if config_path.exists() {
        info!("✓ Configuration loaded from {}", config_path.display());
    } else {
        warn!("⚠️  {} not found, running on defaults", config_path.display());
    }
    config.validate().context("Invalid configuration")?;

    info!(
        "Site {} / {}, capacity {}, {} gate(s), hysteresis={:.1}, min_speed={:.1}, cooldown={:.1}s",
        config.site.lot_id,
        config.site.camera_id,
        config.capacity(),
        config.gates.len(),
        config.crossing.hysteresis,
        config.crossing.min_speed,
        config.crossing.cooldown_s
    );

    let outbox = Outbox::open(&config.relay.db_path)
        .with_context(|| format!("Failed to open outbox {}", config.relay.db_path.display()))?;
    let metrics = PipelineMetrics::new();

    // ── Delivery worker ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if config.relay.ingest_url.is_empty() {
        warn!("📡 No ingest URL configured, events stay in the local outbox");
        None
    } else {
        let transport = HttpTransport::from_config(&config.relay).context("Failed to build HTTP client")?;
        let worker = DeliveryWorker::new(
            outbox.clone(),
            transport,
            DeliverySettings::from_config(&config.relay),
        )
        .with_metrics(metrics.clone());
        info!("📡 Ingest URL: {}", config.relay.ingest_url);
        Some(tokio::spawn(worker.run(shutdown_rx)))
    };

    // ── Frame thread ──
    let pipeline = OccupancyPipeline::new(&config, outbox, metrics.clone());
    let event_log_path = config.logging.event_log_path.clone();
    let status_config = config.status.clone();
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("frames".to_string())
        .spawn(move || {
            let result = run_frame_loop(pipeline, event_log_path.as_deref(), &status_config);
            let _ = done_tx.send(result);
        })
        .context("Failed to start frame thread")?;

    tokio::select! {
        result = done_rx => match result {
            Ok(Ok(())) => info!("✓ Input stream ended"),
            Ok(Err(e)) => error!("❌ Frame loop failed: {:#}", e),
            Err(_) => error!("❌ Frame thread exited without reporting"),
        },
        _ = tokio::signal::ctrl_c() => info!("🛑 Interrupted, shutting down"),
    }

    // ── Shutdown ──
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        let grace = Duration::from_secs_f64(config.relay.request_timeout_s + 1.0);
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("❌ Delivery worker panicked: {}", e),
            Err(_) => warn!("⚠️  Delivery worker did not stop within {:.0}s", grace.as_secs_f64()),
        }
    }

    let summary = metrics.summary();
    info!("\n========================================");
    info!("  Frames:          {} ({:.1} fps)", summary.total_frames, summary.fps);
    info!("  Events emitted:  {}", summary.events_emitted);
    info!("  Events dropped:  {}", summary.events_dropped);
    info!("  Delivered:       {} ok / {} failed", summary.deliveries_ok, summary.deliveries_failed);
    info!("========================================\n");

    Ok(())
}

fn run_frame_loop(mut pipeline: OccupancyPipeline, event_log_path: Option<&Path>, status: &StatusConfig) -> Result<()> {
    let mut event_log = match event_log_path {
        Some(path) => Some(open_event_log(path)?),
        None => None,
    };
    let status_interval = Duration::from_secs_f64(status.interval_s);
    let mut last_status = Instant::now();

    let stdin = std::io::stdin();
    let mut lines = FrameLines::new(stdin.lock());
    while let Some(line) = lines.next_line().context("Failed to read stdin")? {
        let parsed = line.and_then(|line| {
            if line.trim().is_empty() {
                Ok(None)
            } else {
                parse_frame_line(&line, unix_now_s()).map(Some)
            }
        });

        match parsed {
            Ok(None) => continue,
            Ok(Some(parsed)) => {
                if parsed.skipped > 0 {
                    warn!("⚠️  Skipped {} malformed detection(s)", parsed.skipped);
                }
                pipeline.process_frame(&parsed.frame);
            }
            Err(e) => {
                warn!("⚠️  Skipping frame line: {}", e);
                let metrics = pipeline.metrics();
                metrics.inc(&metrics.malformed_lines);
            }
        }

        for event in pipeline.drain_events() {
            if let (Some(file), PipelineEvent::OccupancyChanged(ev)) = (event_log.as_mut(), &event) {
                if let Err(e) = append_jsonl(file, ev) {
                    error!("❌ Failed to write event log: {}", e);
                }
            }
        }

        if last_status.elapsed() >= status_interval {
            report_status(&pipeline, status.path.as_deref());
            last_status = Instant::now();
        }
    }

    report_status(&pipeline, status.path.as_deref());
    Ok(())
}

fn open_event_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    info!("📝 Event log: {}", path.display());
    Ok(file)
}

fn append_jsonl<T: serde::Serialize>(file: &mut File, value: &T) -> Result<()> {
    let json_line = serde_json::to_string(value)?;
    writeln!(file, "{}", json_line)?;
    file.flush()?;
    Ok(())
}

fn report_status(pipeline: &OccupancyPipeline, path: Option<&Path>) {
    let status = pipeline.status();
    info!(
        "📊 occupancy {}/{} mode={} frames={} events={} pending_outbox={}",
        status.occupancy,
        status.capacity,
        status.mode.as_str(),
        status.metrics.total_frames,
        status.metrics.events_emitted,
        status
            .pending_outbox
            .map_or_else(|| "?".to_string(), |n| n.to_string())
    );
    if let (Some(remaining), Some(unique)) = (status.bootstrap_remaining_s, status.bootstrap_unique_ids) {
        info!("⏳ Bootstrap: {} unique id(s), {:.0}s left", unique, remaining);
    }

    let Some(path) = path else {
        return;
    };
    if let Err(e) = write_status_file(path, &status) {
        warn!("⚠️  Failed to write status file {}: {:#}", path.display(), e);
    }
}

fn write_status_file<T: serde::Serialize>(path: &Path, status: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string_pretty(status)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn unix_now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
