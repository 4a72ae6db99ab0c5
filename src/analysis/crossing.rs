// src/analysis/crossing.rs
//
// Per-gate, per-track crossing state machine.
//
// Each (gate, track) pair is classified every frame as ABOVE / INSIDE /
// BELOW the gate's band. A count is only possible when a track LEAVES the
// band:
//
//   outside → INSIDE   record origin_side (the side just left)
//   INSIDE  → outside  evaluate emission, then clear origin_side
//
// Sign rule:
//   origin ABOVE, exit BELOW  → +1 (entering the monitored area)
//   origin BELOW, exit ABOVE  → -1 (leaving it)
//   origin == exit side       → nothing (the track backed out)
//   origin NONE               → born-in-band fallback (velocity sign)
//
// Emission gating: x-window, |vy| >= min_speed, cooldown per (gate, track),
// and minimum track age. The global invert flag flips every delta.
//
// At low frame rates a track can jump from ABOVE straight to BELOW. That
// frame is replayed as entry then exit, with the entry attributed to the
// boundary closest to the previous position.
//
// State lives in an index-addressed table: one slot per gate (by bank
// index), each holding a map from track id to state. A track that has no
// entry yet is an explicit first-sighting branch, never a default value.

use super::gate::{reference_y, Gate, GateBank};
use crate::config::CrossingConfig;
use crate::types::{OriginSide, Region, TrackId, TrackedDetection};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

/// Floor on the elapsed time used for speed estimation (seconds).
const MIN_DT_S: f64 = 1e-3;

/// Age is capped so a parked object cannot overflow the counter.
const MAX_TRACK_AGE: u32 = 1000;

/// Minimum seconds between two stale-state sweeps.
const EVICTION_INTERVAL_S: f64 = 1.0;

// ============================================================================
// TYPES
// ============================================================================

/// Crossing state for one (gate, track) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingState {
    pub region: Region,
    /// Only written on an outside → INSIDE transition.
    pub origin: OriginSide,
    pub last_ref_y: f32,
    pub last_ts: f64,
    /// Frames observed inside the gate's x-window.
    pub age: u32,
}

impl CrossingState {
    fn first_sighting(region: Region, ref_y: f32, ts: f64, in_window: bool) -> Self {
        Self {
            region,
            origin: OriginSide::None,
            last_ref_y: ref_y,
            last_ts: ts,
            age: u32::from(in_window),
        }
    }
}

/// Which rule produced an emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionRule {
    /// Known origin side, exit on the opposite side.
    Traversal,
    /// Track was first seen inside the band; sign taken from velocity.
    BornInBand,
}

impl EmissionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traversal => "TRAVERSAL",
            Self::BornInBand => "BORN_IN_BAND",
        }
    }
}

/// A qualifying exit. The pipeline turns this into an OccupancyEvent.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossingDecision {
    pub gate_index: usize,
    pub gate_name: String,
    pub track_id: TrackId,
    pub class_id: i64,
    pub delta: i32,
    /// |vy| after clamping.
    pub speed: f32,
    pub ref_y: f32,
    pub rule: EmissionRule,
}

/// Outcome of the emission gates for one exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateCheck {
    pub window_ok: bool,
    pub speed_ok: bool,
    pub cooldown_ok: bool,
    pub age_ok: bool,
}

impl GateCheck {
    pub fn passed(&self) -> bool {
        self.window_ok && self.speed_ok && self.cooldown_ok && self.age_ok
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if !self.window_ok {
            reasons.push("xwin");
        }
        if !self.speed_ok {
            reasons.push("speed");
        }
        if !self.cooldown_ok {
            reasons.push("cooldown");
        }
        if !self.age_ok {
            reasons.push("age");
        }
        reasons
    }
}

// ============================================================================
// STATE TABLE
// ============================================================================

#[derive(Debug, Default)]
struct GateTracks {
    states: HashMap<TrackId, CrossingState>,
    last_event_at: HashMap<TrackId, f64>,
}

/// (gate index, track id) → state, backed by one slot per gate.
#[derive(Debug)]
pub struct CrossingTable {
    gates: Vec<GateTracks>,
}

impl CrossingTable {
    pub fn new(gate_count: usize) -> Self {
        Self {
            gates: (0..gate_count).map(|_| GateTracks::default()).collect(),
        }
    }

    pub fn get(&self, gate_index: usize, track_id: TrackId) -> Option<&CrossingState> {
        self.gates.get(gate_index)?.states.get(&track_id)
    }

    pub fn last_event_at(&self, gate_index: usize, track_id: TrackId) -> Option<f64> {
        self.gates
            .get(gate_index)?
            .last_event_at
            .get(&track_id)
            .copied()
    }

    /// Number of live (gate, track) states.
    pub fn len(&self) -> usize {
        self.gates.iter().map(|g| g.states.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slot in &mut self.gates {
            slot.states.clear();
            slot.last_event_at.clear();
        }
    }

    /// Drop states not observed since `now - ttl_s`. Returns how many went.
    pub fn evict_stale(&mut self, now: f64, ttl_s: f64) -> usize {
        let cutoff = now - ttl_s;
        let mut evicted = 0;
        for slot in &mut self.gates {
            let before = slot.states.len();
            slot.states.retain(|_, s| s.last_ts >= cutoff);
            evicted += before - slot.states.len();
            let states = &slot.states;
            slot.last_event_at
                .retain(|tid, ts| states.contains_key(tid) || *ts >= cutoff);
        }
        evicted
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct CrossingEngine {
    config: CrossingConfig,
    gates: GateBank,
    table: CrossingTable,
    last_eviction_ts: Option<f64>,
}

impl CrossingEngine {
    pub fn new(gates: GateBank, config: CrossingConfig) -> Self {
        let table = CrossingTable::new(gates.len());
        Self {
            config,
            gates,
            table,
            last_eviction_ts: None,
        }
    }

    pub fn gates(&self) -> &GateBank {
        &self.gates
    }

    pub fn table(&self) -> &CrossingTable {
        &self.table
    }

    pub fn state(&self, gate_index: usize, track_id: TrackId) -> Option<&CrossingState> {
        self.table.get(gate_index, track_id)
    }

    /// Discard all per-gate state (used when bootstrap hands over).
    pub fn reset(&mut self) {
        let dropped = self.table.len();
        self.table.clear();
        self.last_eviction_ts = None;
        debug!("Crossing state reset ({} entries dropped)", dropped);
    }

    /// Evaluate one frame of tracked detections against every gate, in
    /// gate order, and return the qualifying exits.
    pub fn process(&mut self, detections: &[TrackedDetection], timestamp_s: f64) -> Vec<CrossingDecision> {
        let mut decisions = Vec::new();
        for det in detections {
            decisions.extend(self.observe(det, timestamp_s));
        }
        self.maybe_evict(timestamp_s);
        decisions
    }

    /// Evaluate one detection against every gate.
    pub fn observe(&mut self, det: &TrackedDetection, timestamp_s: f64) -> Vec<CrossingDecision> {
        let ref_y = reference_y(
            &det.bbox,
            self.config.reference_mode,
            self.config.reference_fraction,
        );
        let (cx, _) = det.bbox.center();

        let mut decisions = Vec::new();
        for (gate_index, gate) in self.gates.iter() {
            let Some(slot) = self.table.gates.get_mut(gate_index) else {
                continue;
            };
            if let Some(decision) = step_gate(
                &self.config,
                gate,
                gate_index,
                slot,
                det,
                cx,
                ref_y,
                timestamp_s,
            ) {
                decisions.push(decision);
            }
        }
        decisions
    }

    fn maybe_evict(&mut self, now: f64) {
        let due = self
            .last_eviction_ts
            .map_or(true, |last| now - last >= EVICTION_INTERVAL_S);
        if !due {
            return;
        }
        self.last_eviction_ts = Some(now);
        let evicted = self.table.evict_stale(now, self.config.state_ttl_s);
        if evicted > 0 {
            debug!("Evicted {} stale crossing state(s)", evicted);
        }
    }
}

/// Region transitions implied by moving from `from` to `to` in one frame.
/// A jump across the whole band is replayed as entry followed by exit.
fn transition_path(gate: &Gate, from: Region, to: Region, prev_y: f32) -> Vec<(Region, Region, OriginSide)> {
    if from == to {
        return Vec::new();
    }
    if from == Region::Inside || to == Region::Inside {
        return vec![(from, to, OriginSide::from_region(from))];
    }

    // Both boundaries crossed: the one nearer the previous position first.
    let (d_top, d_bottom) = gate.boundary_distances(prev_y);
    let entry_side = if d_top <= d_bottom {
        OriginSide::Above
    } else {
        OriginSide::Below
    };
    debug!(
        "{}: band skipped in one frame ({} → {}), entry via {}",
        gate.name,
        from.as_str(),
        to.as_str(),
        entry_side.as_str()
    );
    vec![
        (from, Region::Inside, entry_side),
        (Region::Inside, to, OriginSide::None),
    ]
}

#[allow(clippy::too_many_arguments)]
fn step_gate(
    config: &CrossingConfig,
    gate: &Gate,
    gate_index: usize,
    slot: &mut GateTracks,
    det: &TrackedDetection,
    cx: f32,
    ref_y: f32,
    timestamp_s: f64,
) -> Option<CrossingDecision> {
    let region = gate.classify(ref_y, config.hysteresis);
    let in_window = gate.in_window(cx);
    let GateTracks {
        states,
        last_event_at,
    } = slot;

    let state = match states.entry(det.track_id) {
        Entry::Vacant(vacant) => {
            if region == Region::Inside {
                debug!(
                    "{}: track {} first seen inside band (y={:.1})",
                    gate.name, det.track_id, ref_y
                );
            }
            vacant.insert(CrossingState::first_sighting(
                region,
                ref_y,
                timestamp_s,
                in_window,
            ));
            return None;
        }
        Entry::Occupied(occupied) => occupied.into_mut(),
    };

    if in_window {
        state.age = (state.age + 1).min(MAX_TRACK_AGE);
    }

    let dt = (timestamp_s - state.last_ts).max(MIN_DT_S);
    let mut vy = (ref_y - state.last_ref_y) / dt as f32;
    if let Some(max_speed) = config.max_speed {
        vy = vy.clamp(-max_speed, max_speed);
    }

    let mut decision = None;
    for (from, to, entry_side) in transition_path(gate, state.region, region, state.last_ref_y) {
        if to == Region::Inside {
            state.origin = entry_side;
            debug!(
                "{}: track {} entered band from {}",
                gate.name,
                det.track_id,
                entry_side.as_str()
            );
        } else if from == Region::Inside {
            let check = GateCheck {
                window_ok: in_window,
                speed_ok: vy.abs() >= config.min_speed,
                cooldown_ok: last_event_at
                    .get(&det.track_id)
                    .map_or(true, |&last| timestamp_s - last >= config.cooldown_s),
                age_ok: state.age >= config.min_track_age,
            };
            decision = evaluate_exit(config, gate, gate_index, det, state, to, vy, ref_y, check);
            if decision.is_some() {
                last_event_at.insert(det.track_id, timestamp_s);
            }
            state.origin = OriginSide::None;
        }
    }

    state.region = region;
    state.last_ref_y = ref_y;
    state.last_ts = timestamp_s;
    decision
}

#[allow(clippy::too_many_arguments)]
fn evaluate_exit(
    config: &CrossingConfig,
    gate: &Gate,
    gate_index: usize,
    det: &TrackedDetection,
    state: &CrossingState,
    exit: Region,
    vy: f32,
    ref_y: f32,
    check: GateCheck,
) -> Option<CrossingDecision> {
    let (raw_delta, rule) = match (state.origin, exit) {
        (OriginSide::Above, Region::Below) => (1, EmissionRule::Traversal),
        (OriginSide::Below, Region::Above) => (-1, EmissionRule::Traversal),
        (OriginSide::Above, _) | (OriginSide::Below, _) => {
            debug!(
                "{}: track {} left band on its entry side ({}), no count",
                gate.name,
                det.track_id,
                exit.as_str()
            );
            return None;
        }
        (OriginSide::None, _) => born_in_band_delta(config, exit, vy)?,
    };

    if !check.passed() {
        debug!(
            "{}: track {} exit {} denied: skip:{}",
            gate.name,
            det.track_id,
            exit.as_str(),
            check.reasons().join(",")
        );
        return None;
    }

    let delta = if config.invert_direction {
        -raw_delta
    } else {
        raw_delta
    };

    debug!(
        "🚗 {}: track {} {} {} (vy={:+.1}, rule={})",
        gate.name,
        det.track_id,
        if delta > 0 { "+1" } else { "-1" },
        exit.as_str(),
        vy,
        rule.as_str()
    );

    Some(CrossingDecision {
        gate_index,
        gate_name: gate.name.clone(),
        track_id: det.track_id,
        class_id: det.class_id,
        delta,
        speed: vy.abs(),
        ref_y,
        rule,
    })
}

/// Fallback for a track whose origin is unknown: exiting downward while
/// moving down counts +1, exiting upward while moving up counts -1.
/// Heuristic; can double count or miss depending on where the track spawned.
fn born_in_band_delta(config: &CrossingConfig, exit: Region, vy: f32) -> Option<(i32, EmissionRule)> {
    if !config.born_in_band_fallback {
        return None;
    }
    match exit {
        Region::Below if vy > 0.0 => Some((1, EmissionRule::BornInBand)),
        Region::Above if vy < 0.0 => Some((-1, EmissionRule::BornInBand)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferenceMode;
    use crate::types::BoundingBox;

    fn config() -> CrossingConfig {
        CrossingConfig {
            reference_mode: ReferenceMode::Center,
            hysteresis: 2.0,
            min_speed: 1.0,
            cooldown_s: 0.0,
            min_track_age: 2,
            ..CrossingConfig::default()
        }
    }

    fn bank() -> GateBank {
        GateBank::new(vec![Gate::new("G1", 30.0, 52.0, 292.0, 398.0)])
    }

    /// Box whose centre sits at (x, y).
    fn det(track_id: TrackId, x: f32, y: f32) -> TrackedDetection {
        TrackedDetection {
            track_id,
            class_id: 2,
            bbox: BoundingBox::new(x - 10.0, y - 5.0, x + 10.0, y + 5.0),
        }
    }

    fn run(engine: &mut CrossingEngine, track: TrackId, path: &[(f32, f32)]) -> Vec<CrossingDecision> {
        let mut out = Vec::new();
        for (i, &(x, y)) in path.iter().enumerate() {
            out.extend(engine.process(&[det(track, x, y)], i as f64));
        }
        out
    }

    #[test]
    fn test_full_traversal_down_emits_plus_one() {
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, 1);
        assert_eq!(out[0].rule, EmissionRule::Traversal);
        assert_eq!(out[0].gate_name, "G1");
        assert!((out[0].speed - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_full_traversal_up_emits_minus_one() {
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 1, &[(340.0, 60.0), (340.0, 40.0), (340.0, 20.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, -1);
    }

    #[test]
    fn test_invert_flag_flips_sign() {
        let cfg = CrossingConfig {
            invert_direction: true,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, -1);
    }

    #[test]
    fn test_same_side_exit_clears_origin_without_event() {
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 20.0)]);
        assert!(out.is_empty());
        let state = engine.state(0, 1).unwrap();
        assert_eq!(state.origin, OriginSide::None);
        assert_eq!(state.region, Region::Above);

        // The next genuine traversal still counts exactly once
        let mut out = Vec::new();
        out.extend(engine.process(&[det(1, 340.0, 40.0)], 3.0));
        out.extend(engine.process(&[det(1, 340.0, 60.0)], 4.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, 1);
    }

    #[test]
    fn test_origin_cleared_even_when_gating_denies() {
        // Outside the x-window: exit is denied, origin must still be cleared
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (500.0, 60.0)]);
        assert!(out.is_empty());
        assert_eq!(engine.state(0, 1).unwrap().origin, OriginSide::None);

        // Wobbling back inside and out below must not produce a late count
        let mut out = Vec::new();
        out.extend(engine.process(&[det(1, 340.0, 50.0)], 3.0));
        out.extend(engine.process(&[det(1, 340.0, 60.0)], 4.0));
        assert!(out.is_empty(), "re-entry from below then exit below is a backout");
    }

    #[test]
    fn test_slow_exit_is_denied() {
        let cfg = CrossingConfig {
            min_speed: 50.0,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_max_speed_clamps_reported_speed() {
        let cfg = CrossingConfig {
            max_speed: Some(5.0),
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].speed, 5.0);
    }

    #[test]
    fn test_min_track_age_gate() {
        let cfg = CrossingConfig {
            min_track_age: 5,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_cooldown_blocks_rapid_second_event() {
        let cfg = CrossingConfig {
            cooldown_s: 10.0,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(
            &mut engine,
            1,
            &[
                (340.0, 20.0),
                (340.0, 40.0),
                (340.0, 60.0), // +1 at t=2
                (340.0, 40.0),
                (340.0, 20.0), // would be -1 at t=4, inside cooldown
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(engine.table().last_event_at(0, 1), Some(2.0));
    }

    #[test]
    fn test_born_in_band_fallback_uses_velocity_sign() {
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 7, &[(340.0, 35.0), (340.0, 45.0), (340.0, 60.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, 1);
        assert_eq!(out[0].rule, EmissionRule::BornInBand);

        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 8, &[(340.0, 45.0), (340.0, 35.0), (340.0, 20.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, -1);
    }

    #[test]
    fn test_born_in_band_fallback_can_be_disabled() {
        let cfg = CrossingConfig {
            born_in_band_fallback: false,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        let out = run(&mut engine, 7, &[(340.0, 35.0), (340.0, 45.0), (340.0, 60.0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_band_skipped_in_single_frame_counts_once() {
        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 1, &[(340.0, 10.0), (340.0, 15.0), (340.0, 80.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, 1);
        assert_eq!(out[0].rule, EmissionRule::Traversal);

        let mut engine = CrossingEngine::new(bank(), config());
        let out = run(&mut engine, 2, &[(340.0, 90.0), (340.0, 85.0), (340.0, 5.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, -1);
    }

    #[test]
    fn test_two_gates_each_emit_in_same_frame() {
        let bank = GateBank::new(vec![
            Gate::new("G1", 30.0, 52.0, 292.0, 398.0),
            Gate::new("G2", 35.0, 50.0, 300.0, 380.0),
        ]);
        let cfg = CrossingConfig {
            cooldown_s: 5.0,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank, cfg);
        let out = run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0), (340.0, 60.0)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].gate_index, 0);
        assert_eq!(out[1].gate_index, 1);
        assert!(out.iter().all(|d| d.delta == 1));
        assert_eq!(engine.table().last_event_at(0, 1), Some(2.0));
        assert_eq!(engine.table().last_event_at(1, 1), Some(2.0));
    }

    #[test]
    fn test_tracks_are_independent() {
        let mut engine = CrossingEngine::new(bank(), config());
        let frames = [
            vec![det(1, 340.0, 20.0), det(2, 340.0, 60.0)],
            vec![det(1, 340.0, 40.0), det(2, 340.0, 40.0)],
            vec![det(1, 340.0, 60.0), det(2, 340.0, 20.0)],
        ];
        let mut deltas = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            for d in engine.process(frame, i as f64) {
                deltas.push((d.track_id, d.delta));
            }
        }
        assert_eq!(deltas, vec![(1, 1), (2, -1)]);
    }

    #[test]
    fn test_stale_state_is_evicted() {
        let cfg = CrossingConfig {
            state_ttl_s: 5.0,
            ..config()
        };
        let mut engine = CrossingEngine::new(bank(), cfg);
        engine.process(&[det(1, 340.0, 20.0)], 0.0);
        assert_eq!(engine.table().len(), 1);
        engine.process(&[det(2, 340.0, 20.0)], 10.0);
        assert!(engine.state(0, 1).is_none());
        assert!(engine.state(0, 2).is_some());
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut engine = CrossingEngine::new(bank(), config());
        run(&mut engine, 1, &[(340.0, 20.0), (340.0, 40.0)]);
        assert!(!engine.table().is_empty());
        engine.reset();
        assert!(engine.table().is_empty());
    }
}
