// src/analysis/bootstrap.rs
//
// Startup population scan. While the window is open the pipeline runs only
// the identity tracker and feeds every tracked detection here; crossing
// detection is suspended. When the window closes the set of distinct ids
// seen inside the scan region (plus a configured offset) seeds the counter.

use crate::config::BootstrapConfig;
use crate::types::{TrackId, TrackedDetection};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatus {
    /// Window still open.
    Collecting,
    /// Window closed on this frame; counter should be seeded with `seed`.
    Complete { seed: u32, unique_ids: usize },
}

pub struct BootstrapEstimator {
    config: BootstrapConfig,
    capacity: u32,
    started_at: Option<f64>,
    seen: HashSet<TrackId>,
    finished: bool,
}

impl BootstrapEstimator {
    pub fn new(config: BootstrapConfig, capacity: u32) -> Self {
        Self {
            config,
            capacity,
            started_at: None,
            seen: HashSet::new(),
            finished: false,
        }
    }

    pub fn unique_count(&self) -> usize {
        self.seen.len()
    }

    /// Seconds left in the window, measured from the first observed frame.
    pub fn remaining_s(&self, timestamp_s: f64) -> f64 {
        match self.started_at {
            Some(start) => (self.config.duration_s - (timestamp_s - start)).max(0.0),
            None => self.config.duration_s,
        }
    }

    /// Feed one frame. The window opens on the first call and closes on the
    /// first frame at or past `duration_s`; that closing frame is not
    /// scanned, it belongs to counting mode.
    pub fn observe(&mut self, detections: &[TrackedDetection], timestamp_s: f64) -> BootstrapStatus {
        if self.finished {
            return self.complete();
        }

        let start = *self.started_at.get_or_insert_with(|| {
            info!(
                "⏳ Bootstrap scan started ({:.0}s window, offset {:+})",
                self.config.duration_s, self.config.offset
            );
            timestamp_s
        });

        if timestamp_s - start >= self.config.duration_s {
            self.finished = true;
            let status = self.complete();
            if let BootstrapStatus::Complete { seed, unique_ids } = status {
                info!(
                    "✅ Bootstrap complete: {} unique id(s) {:+} offset → seed {}",
                    unique_ids, self.config.offset, seed
                );
            }
            return status;
        }

        for det in detections {
            let (cx, cy) = det.bbox.center();
            if self.config.scan_region.contains(cx, cy) && self.seen.insert(det.track_id) {
                debug!("Bootstrap saw track {} ({} unique)", det.track_id, self.seen.len());
            }
        }
        BootstrapStatus::Collecting
    }

    fn complete(&self) -> BootstrapStatus {
        let raw = self.seen.len() as i64 + self.config.offset;
        let seed = raw.clamp(0, i64::from(self.capacity)) as u32;
        BootstrapStatus::Complete {
            seed,
            unique_ids: self.seen.len(),
        }
    }
}
