// src/pipeline/metrics.rs
//
// Runtime counters shared between the frame loop and the delivery worker.
// Reported through the periodic status heartbeat and the status file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub detections_seen: Arc<AtomicU64>,
    pub detections_filtered: Arc<AtomicU64>,
    pub events_emitted: Arc<AtomicU64>,
    /// Crossings discarded because the outbox write failed.
    pub events_dropped: Arc<AtomicU64>,
    pub recovery_failures: Arc<AtomicU64>,
    pub malformed_lines: Arc<AtomicU64>,
    pub deliveries_ok: Arc<AtomicU64>,
    pub deliveries_failed: Arc<AtomicU64>,
    /// Wall-clock ms of the most recent frame; 0 before the first.
    pub last_frame_unix_ms: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            detections_seen: Arc::new(AtomicU64::new(0)),
            detections_filtered: Arc::new(AtomicU64::new(0)),
            events_emitted: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
            recovery_failures: Arc::new(AtomicU64::new(0)),
            malformed_lines: Arc::new(AtomicU64::new(0)),
            deliveries_ok: Arc::new(AtomicU64::new(0)),
            deliveries_failed: Arc::new(AtomicU64::new(0)),
            last_frame_unix_ms: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_frame(&self) {
        self.inc(&self.total_frames);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_frame_unix_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            detections_seen: self.detections_seen.load(Ordering::Relaxed),
            detections_filtered: self.detections_filtered.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            deliveries_ok: self.deliveries_ok.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            last_frame_unix_ms: self.last_frame_unix_ms.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub detections_seen: u64,
    pub detections_filtered: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub recovery_failures: u64,
    pub malformed_lines: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub last_frame_unix_ms: u64,
    pub elapsed_secs: f64,
}
