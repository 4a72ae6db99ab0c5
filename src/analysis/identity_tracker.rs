// src/analysis/identity_tracker.rs
//
// Centroid tracker for detections that arrive without an upstream identity.
//
// Design:
//   - Greedy nearest-centroid matching, detections in input order
//   - Each existing track can be claimed by at most one detection per frame
//   - No motion prediction: identity swaps are possible under occlusion,
//     which the crossing engine tolerates because it counts per traversal
//   - Tracks unmatched for more than `max_age` frames are dropped
//
// Limitation: matching is first-come, not globally optimal. With a handful
// of vehicles in view per frame this has not mattered in practice.

use crate::config::TrackerConfig;
use crate::types::{BoundingBox, TrackId};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub centroid: (f32, f32),
    /// Frames since the last matched detection.
    pub misses: u32,
    pub last_seen_s: f64,
}

pub struct IdentityTracker {
    config: TrackerConfig,
    // BTreeMap keeps iteration (and therefore tie-breaking) deterministic
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let next_id = config.id_base;
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id,
        }
    }

    /// One identity per box, in input order. `None` means the box was
    /// refused (non-finite coordinates) and must not be tracked.
    pub fn update(&mut self, boxes: &[BoundingBox], timestamp_s: f64) -> Vec<Option<TrackId>> {
        let max_distance = self.config.max_distance;
        let mut claimed: Vec<TrackId> = Vec::with_capacity(boxes.len());
        let mut assigned = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            if !bbox.is_finite() {
                debug!("Refusing to track non-finite box {:?}", bbox);
                assigned.push(None);
                continue;
            }
            let (cx, cy) = bbox.center();

            let mut best: Option<(TrackId, f32)> = None;
            for track in self.tracks.values() {
                if claimed.contains(&track.id) {
                    continue;
                }
                let d = ((cx - track.centroid.0).powi(2) + (cy - track.centroid.1).powi(2)).sqrt();
                let better = match best {
                    Some((_, best_d)) => d < best_d,
                    None => d <= max_distance,
                };
                if better {
                    best = Some((track.id, d));
                }
            }

            let id = match best {
                Some((id, _)) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.centroid = (cx, cy);
                        track.misses = 0;
                        track.last_seen_s = timestamp_s;
                    }
                    id
                }
                None => {
                    let id = self.allocate_id();
                    self.tracks.insert(
                        id,
                        Track {
                            id,
                            centroid: (cx, cy),
                            misses: 0,
                            last_seen_s: timestamp_s,
                        },
                    );
                    debug!("🆕 Track {} created at ({:.0}, {:.0})", id, cx, cy);
                    id
                }
            };
            claimed.push(id);
            assigned.push(Some(id));
        }

        // Age everything that went unmatched this frame, then drop the old
        let max_age = self.config.max_age;
        let before = self.tracks.len();
        self.tracks.retain(|id, track| {
            if !claimed.contains(id) {
                track.misses += 1;
            }
            track.misses <= max_age
        });
        let dropped = before - self.tracks.len();
        if dropped > 0 {
            debug!("Dropped {} lost track(s), {} active", dropped, self.tracks.len());
        }

        assigned
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    fn allocate_id(&mut self) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
