// src/pipeline/orchestrator.rs
//
// Single-threaded per-frame driver.
//
// Frame flow:
//   Frame → detection filter → identity resolution ─┬→ BootstrapEstimator (window open)
//                                                   └→ CrossingEngine → commit
//
// Commit of one crossing:
//   1. build the event from the counter's clamped preview
//   2. enqueue to the outbox (durable)      ── failure: event never happened
//   3. apply the delta to the counter
//   4. persist the recovery record          ── failure: logged, counted
//
// No network I/O happens here. The delivery worker owns that.

use super::event_bus::{EventBus, PipelineEvent, RecentEvents, RECENT_EVENTS};
use super::metrics::{MetricsSummary, PipelineMetrics};
use crate::analysis::bootstrap::{BootstrapEstimator, BootstrapStatus};
use crate::analysis::crossing::{CrossingDecision, CrossingEngine};
use crate::analysis::gate::GateBank;
use crate::analysis::identity_tracker::IdentityTracker;
use crate::config::{Config, FilterConfig, SiteConfig};
use crate::occupancy::OccupancyCounter;
use crate::recovery::RecoveryState;
use crate::relay::outbox::Outbox;
use crate::types::{Detection, Frame, OccupancyEvent, OutboxPayload, TrackedDetection};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Bootstrapping,
    Counting,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Counting => "COUNTING",
        }
    }
}

/// Where the starting occupancy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    Recovery,
    Seed,
    Bootstrap,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub mode: PipelineMode,
    pub tracked: usize,
    pub events: Vec<OccupancyEvent>,
}

/// Snapshot written to the status file and heartbeat log.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ts: String,
    pub lot_id: String,
    pub camera_id: String,
    pub mode: PipelineMode,
    pub occupancy: u32,
    pub capacity: u32,
    pub last_frame_unix_ms: u64,
    /// Identities held by the centroid tracker.
    pub active_tracks: usize,
    /// Seconds left in the bootstrap window, while bootstrapping.
    pub bootstrap_remaining_s: Option<f64>,
    pub bootstrap_unique_ids: Option<usize>,
    pub pending_outbox: Option<u64>,
    pub metrics: MetricsSummary,
    pub recent_events: Vec<OccupancyEvent>,
}

pub struct OccupancyPipeline {
    site: SiteConfig,
    filter: FilterConfig,
    tracker: IdentityTracker,
    engine: CrossingEngine,
    bootstrap: Option<BootstrapEstimator>,
    counter: OccupancyCounter,
    recovery: RecoveryState,
    outbox: Outbox,
    metrics: PipelineMetrics,
    bus: EventBus,
    recent: RecentEvents,
    mode: PipelineMode,
    start_source: StartSource,
    last_frame_ts: Option<f64>,
}

impl OccupancyPipeline {
    /// Resolve the starting occupancy and mode.
    ///
    /// A recovery record wins unless `fresh_start` is set. Without one the
    /// counter starts from the configured seed, and if bootstrap is enabled
    /// it is replaced by the scan result when the window closes.
    pub fn new(config: &Config, outbox: Outbox, metrics: PipelineMetrics) -> Self {
        let capacity = config.capacity();
        let recovery = RecoveryState::new(config.recovery.state_path.clone());

        let resumed = if config.occupancy.fresh_start {
            info!("🧹 fresh_start set, ignoring any recovery record");
            None
        } else {
            recovery.load()
        };

        let (initial, mode, start_source, bootstrap) = match resumed {
            Some(record) => (record.occupancy, PipelineMode::Counting, StartSource::Recovery, None),
            None if config.bootstrap.is_enabled() => (
                config.seed_occupancy(),
                PipelineMode::Bootstrapping,
                StartSource::Bootstrap,
                Some(BootstrapEstimator::new(config.bootstrap.clone(), capacity)),
            ),
            None => (config.seed_occupancy(), PipelineMode::Counting, StartSource::Seed, None),
        };

        let counter = OccupancyCounter::new(initial, capacity);
        if counter.current() != initial {
            warn!(
                "⚠️  Starting occupancy {} exceeds capacity {}, clamped",
                initial, capacity
            );
        }

        let pipeline = Self {
            site: config.site.clone(),
            filter: config.filter.clone(),
            tracker: IdentityTracker::new(config.tracker.clone()),
            engine: CrossingEngine::new(GateBank::from_config(&config.gates), config.crossing.clone()),
            bootstrap,
            counter,
            recovery,
            outbox,
            metrics,
            bus: EventBus::new(256),
            recent: RecentEvents::new(RECENT_EVENTS),
            mode,
            start_source,
            last_frame_ts: None,
        };

        info!(
            "🅿️  Occupancy pipeline ready: {}/{} ({:?}), mode {}, {} gate(s)",
            pipeline.counter.current(),
            capacity,
            start_source,
            mode.as_str(),
            pipeline.engine.gates().len()
        );
        for (_, gate) in pipeline.engine.gates().iter() {
            info!(
                "🚧 Gate {}: y {:.0}..{:.0} ({:.0}px band), x {:.0}..{:.0}",
                gate.name,
                gate.top,
                gate.bottom,
                gate.band_height(),
                gate.xmin,
                gate.xmax
            );
        }
        if start_source == StartSource::Seed {
            pipeline.persist_recovery();
        }
        pipeline
    }

    pub fn occupancy(&self) -> u32 {
        self.counter.current()
    }

    pub fn capacity(&self) -> u32 {
        self.counter.capacity()
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn start_source(&self) -> StartSource {
        self.start_source
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        self.bus.drain()
    }

    pub fn recent_events(&self) -> Vec<OccupancyEvent> {
        self.recent.snapshot()
    }

    pub fn process_frame(&mut self, frame: &Frame) -> FrameResult {
        self.metrics.mark_frame();
        self.last_frame_ts = Some(frame.timestamp_s);
        self.metrics
            .add(&self.metrics.detections_seen, frame.detections.len() as u64);

        let tracked = self.resolve_identities(frame);
        let mut result = FrameResult {
            mode: self.mode,
            tracked: tracked.len(),
            events: Vec::new(),
        };

        if self.mode == PipelineMode::Bootstrapping && !self.advance_bootstrap(&tracked, frame.timestamp_s) {
            return result;
        }

        for decision in self.engine.process(&tracked, frame.timestamp_s) {
            if let Some(event) = self.commit(decision) {
                result.events.push(event);
            }
        }
        result.mode = self.mode;
        result
    }

    /// Returns true once the pipeline is counting.
    fn advance_bootstrap(&mut self, tracked: &[TrackedDetection], timestamp_s: f64) -> bool {
        let Some(estimator) = self.bootstrap.as_mut() else {
            self.mode = PipelineMode::Counting;
            return true;
        };
        match estimator.observe(tracked, timestamp_s) {
            BootstrapStatus::Collecting => false,
            BootstrapStatus::Complete { seed, unique_ids } => {
                self.counter.set(seed);
                self.engine.reset();
                self.bootstrap = None;
                self.mode = PipelineMode::Counting;
                self.persist_recovery();
                self.bus.publish(PipelineEvent::BootstrapCompleted { seed, unique_ids });
                info!("🅿️  Counting from bootstrap seed {}", self.counter.current());
                true
            }
        }
    }

    fn resolve_identities(&mut self, frame: &Frame) -> Vec<TrackedDetection> {
        let kept: Vec<&Detection> = frame
            .detections
            .iter()
            .filter(|d| passes_filter(&self.filter, d))
            .collect();
        let filtered = frame.detections.len() - kept.len();
        if filtered > 0 {
            self.metrics
                .add(&self.metrics.detections_filtered, filtered as u64);
        }

        let unidentified: Vec<_> = kept
            .iter()
            .filter(|d| d.identity.is_none())
            .map(|d| d.bbox)
            .collect();
        // Run every frame so unmatched tracks keep ageing
        let mut assigned = self.tracker.update(&unidentified, frame.timestamp_s).into_iter();

        let mut tracked = Vec::with_capacity(kept.len());
        for det in kept {
            let track_id = match det.identity {
                Some(id) => Some(id),
                None => assigned.next().flatten(),
            };
            if let Some(track_id) = track_id {
                tracked.push(TrackedDetection {
                    track_id,
                    class_id: det.class_id,
                    bbox: det.bbox,
                });
            }
        }
        tracked
    }

    fn commit(&mut self, decision: CrossingDecision) -> Option<OccupancyEvent> {
        let before = self.counter.current();
        let after = self.counter.preview(decision.delta);
        let event = OccupancyEvent {
            ts: Utc::now(),
            gate: decision.gate_name,
            delta: decision.delta,
            track_id: decision.track_id,
            class_id: decision.class_id,
            speed: decision.speed,
            ref_y: decision.ref_y,
            occupancy_before: before,
            occupancy_after: after,
        };
        let payload = OutboxPayload::from_event(&event, &self.site.lot_id, &self.site.camera_id, self.counter.capacity());

        if let Err(e) = self.outbox.enqueue(&event, &payload) {
            error!(
                "❌ Crossing {} {:+} (track {}) dropped, outbox write failed: {}",
                event.gate, event.delta, event.track_id, e
            );
            self.metrics.inc(&self.metrics.events_dropped);
            self.bus.publish(PipelineEvent::CrossingDropped {
                gate: event.gate,
                track_id: event.track_id,
                delta: event.delta,
                reason: e.to_string(),
            });
            return None;
        }

        self.counter.apply(event.delta);
        self.persist_recovery();
        self.metrics.inc(&self.metrics.events_emitted);

        info!(
            "🅿️  [{}] {:+} track={} occupancy {} → {} / {}",
            event.gate,
            event.delta,
            event.track_id,
            before,
            after,
            self.counter.capacity()
        );
        self.recent.push(event.clone());
        self.bus.publish(PipelineEvent::OccupancyChanged(event.clone()));
        Some(event)
    }

    fn persist_recovery(&self) {
        match self.recovery.persist(self.counter.current()) {
            Ok(record) => debug!("Recovery record written ({})", record.occupancy),
            Err(e) => {
                error!(
                    "❌ Failed to persist recovery record {}: {}",
                    self.recovery.path().display(),
                    e
                );
                self.metrics.inc(&self.metrics.recovery_failures);
            }
        }
    }

    pub fn status(&self) -> StatusReport {
        let pending_outbox = match self.outbox.pending_count() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("⚠️  Cannot read outbox backlog: {}", e);
                None
            }
        };
        let metrics = self.metrics.summary();
        let (bootstrap_remaining_s, bootstrap_unique_ids) = match (&self.bootstrap, self.mode) {
            (Some(estimator), PipelineMode::Bootstrapping) => (
                Some(estimator.remaining_s(self.last_frame_ts.unwrap_or(0.0))),
                Some(estimator.unique_count()),
            ),
            _ => (None, None),
        };
        StatusReport {
            ts: Utc::now().to_rfc3339(),
            lot_id: self.site.lot_id.clone(),
            camera_id: self.site.camera_id.clone(),
            mode: self.mode,
            occupancy: self.counter.current(),
            capacity: self.counter.capacity(),
            last_frame_unix_ms: metrics.last_frame_unix_ms,
            active_tracks: self.tracker.active_count(),
            bootstrap_remaining_s,
            bootstrap_unique_ids,
            pending_outbox,
            metrics,
            recent_events: self.recent.snapshot(),
        }
    }
}

/// Finite box, minimum size, bounded aspect ratio, allowed class.
fn passes_filter(filter: &FilterConfig, det: &Detection) -> bool {
    let b = &det.bbox;
    if !b.is_finite() {
        return false;
    }
    if b.width() < filter.min_box_w || b.height() < filter.min_box_h {
        return false;
    }
    if b.aspect_ratio() > filter.max_aspect_ratio {
        return false;
    }
    filter.allowed_classes.is_empty() || filter.allowed_classes.contains(&det.class_id)
}
