// src/pipeline/event_bus.rs
//
// Decoupled event system. The pipeline publishes what happened each frame;
// the binary drains the bus to write the event log. A small ring of the
// latest committed events is kept separately for the status report.

use crate::types::{OccupancyEvent, TrackId};
use std::collections::VecDeque;
use tracing::warn;

/// Committed events kept for the status report.
pub const RECENT_EVENTS: usize = 8;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    OccupancyChanged(OccupancyEvent),

    BootstrapCompleted {
        seed: u32,
        unique_ids: usize,
    },

    /// A qualifying crossing that could not be made durable.
    CrossingDropped {
        gate: String,
        track_id: TrackId,
        delta: i32,
        reason: String,
    },
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!("Event bus full ({} events), dropping oldest", self.max_pending);
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}

/// Fixed-size ring of the most recent committed events, oldest first.
#[derive(Debug, Clone)]
pub struct RecentEvents {
    events: VecDeque<OccupancyEvent>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: OccupancyEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<OccupancyEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(after: u32) -> OccupancyEvent {
        OccupancyEvent {
            ts: Utc::now(),
            gate: "G1".to_string(),
            delta: 1,
            track_id: 1,
            class_id: 2,
            speed: 1.0,
            ref_y: 0.0,
            occupancy_before: after.saturating_sub(1),
            occupancy_after: after,
        }
    }

    #[test]
    fn test_bus_drops_oldest_when_full() {
        let mut bus = EventBus::new(2);
        for n in 1..=3 {
            bus.publish(PipelineEvent::OccupancyChanged(event(n)));
        }
        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(&drained[0], PipelineEvent::OccupancyChanged(e) if e.occupancy_after == 2));
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_recent_ring_keeps_latest() {
        let mut recent = RecentEvents::new(RECENT_EVENTS);
        for n in 1..=10 {
            recent.push(event(n));
        }
        let snap = recent.snapshot();
        assert_eq!(snap.len(), RECENT_EVENTS);
        assert_eq!(snap.first().unwrap().occupancy_after, 3);
        assert_eq!(snap.last().unwrap().occupancy_after, 10);
    }
}
