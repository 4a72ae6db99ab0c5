// src/types.rs
//
// Data contracts shared by the tracker, the crossing engine, the counter
// and the outbox. Detections are ephemeral per-frame values; an
// OccupancyEvent is immutable once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable per-object identity, either supplied upstream or assigned by the
/// IdentityTracker.
pub type TrackId = u64;

// ============================================================================
// DETECTIONS
// ============================================================================

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// max(w/h, h/w); infinite for a box with a zero side.
    pub fn aspect_ratio(&self) -> f32 {
        let (w, h) = (self.width(), self.height());
        if w <= 0.0 || h <= 0.0 {
            return f32::INFINITY;
        }
        (w / h).max(h / w)
    }
}

/// One detected object in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Upstream identity. `None` means the IdentityTracker must assign one.
    pub identity: Option<TrackId>,
    pub class_id: i64,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(identity: Option<TrackId>, class_id: i64, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            identity,
            class_id,
            confidence,
            bbox,
        }
    }
}

/// A detection after identity resolution, ready for the crossing engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedDetection {
    pub track_id: TrackId,
    pub class_id: i64,
    pub bbox: BoundingBox,
}

/// All detections observed at one instant.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Seconds on a monotonic-enough clock; used for speed and cooldown.
    pub timestamp_s: f64,
    pub detections: Vec<Detection>,
}

// ============================================================================
// GATE REGIONS
// ============================================================================

/// Where a reference position lies relative to a gate's band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Above,
    Inside,
    Below,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "ABOVE",
            Self::Inside => "INSIDE",
            Self::Below => "BELOW",
        }
    }
}

/// Side a track came from when it entered the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSide {
    Above,
    Below,
    None,
}

impl OriginSide {
    pub fn from_region(region: Region) -> Self {
        match region {
            Region::Above => Self::Above,
            Region::Below => Self::Below,
            Region::Inside => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "ABOVE",
            Self::Below => "BELOW",
            Self::None => "NONE",
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// A committed occupancy change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub ts: DateTime<Utc>,
    pub gate: String,
    pub delta: i32,
    pub track_id: TrackId,
    pub class_id: i64,
    /// |vertical speed| in reference units per second, after clamping.
    pub speed: f32,
    pub ref_y: f32,
    pub occupancy_before: u32,
    pub occupancy_after: u32,
}

/// Wire body forwarded to the remote aggregator, one per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxPayload {
    pub lot_id: String,
    pub camera_id: String,
    pub ts_iso: String,
    pub occupied_count: u32,
    pub total_spots: u32,
}

impl OutboxPayload {
    pub fn from_event(event: &OccupancyEvent, lot_id: &str, camera_id: &str, total_spots: u32) -> Self {
        Self {
            lot_id: lot_id.to_string(),
            camera_id: camera_id.to_string(),
            ts_iso: event.ts.to_rfc3339(),
            occupied_count: event.occupancy_after,
            total_spots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_geometry() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.width(), 20.0);
        assert_eq!(b.height(), 40.0);
        assert_eq!(b.center(), (20.0, 40.0));
        assert_eq!(b.aspect_ratio(), 2.0);
    }

    #[test]
    fn test_degenerate_bbox_aspect_is_infinite() {
        let b = BoundingBox::new(10.0, 20.0, 10.0, 60.0);
        assert!(b.aspect_ratio().is_infinite());
    }

    #[test]
    fn test_payload_uses_occupancy_after() {
        let event = OccupancyEvent {
            ts: Utc::now(),
            gate: "G1".to_string(),
            delta: 1,
            track_id: 4,
            class_id: 2,
            speed: 12.5,
            ref_y: 40.0,
            occupancy_before: 9,
            occupancy_after: 10,
        };
        let payload = OutboxPayload::from_event(&event, "96N", "96N-camera-1", 73);
        assert_eq!(payload.occupied_count, 10);
        assert_eq!(payload.total_spots, 73);
        let json = serde_json::to_value(&payload).unwrap();
        for key in ["lot_id", "camera_id", "ts_iso", "occupied_count", "total_spots"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
