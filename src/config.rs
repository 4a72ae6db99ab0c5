// src/config.rs
//
// One explicit configuration structure. Every tunable is named and
// defaulted; `validate()` runs once before any frame is processed.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Upper bound for polling, backoff, timeout and status intervals.
pub const MAX_INTERVAL_S: f64 = 86_400.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site: SiteConfig,
    pub occupancy: OccupancyConfig,
    pub gates: Vec<GateConfig>,
    pub crossing: CrossingConfig,
    pub filter: FilterConfig,
    pub tracker: TrackerConfig,
    pub bootstrap: BootstrapConfig,
    pub recovery: RecoveryConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    pub status: StatusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            occupancy: OccupancyConfig::default(),
            gates: default_gates(),
            crossing: CrossingConfig::default(),
            filter: FilterConfig::default(),
            tracker: TrackerConfig::default(),
            bootstrap: BootstrapConfig::default(),
            recovery: RecoveryConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub lot_id: String,
    pub camera_id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            lot_id: "96N".to_string(),
            camera_id: "96N-camera-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    /// Upper clamp for the counter (total spots).
    pub capacity: i64,
    /// Starting value when neither recovery nor bootstrap supplies one.
    pub seed_occupancy: i64,
    /// Ignore the persisted last-occupancy record.
    pub fresh_start: bool,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            capacity: 73,
            seed_occupancy: 0,
            fresh_start: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub boundary_a: f32,
    pub boundary_b: f32,
    pub xmin: f32,
    pub xmax: f32,
}

/// How the reference vertical position is derived from a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    Top,
    Bottom,
    Center,
    TopQuarter,
    /// y1 + `reference_fraction` * height
    Fraction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossingConfig {
    pub reference_mode: ReferenceMode,
    pub reference_fraction: f32,
    /// Distance past a boundary before a position counts as outside the band.
    pub hysteresis: f32,
    /// Minimum |vertical speed| (units per second) for an exit to count.
    pub min_speed: f32,
    /// Optional clamp applied to the speed estimate.
    pub max_speed: Option<f32>,
    /// Minimum seconds between two events for the same (gate, track).
    pub cooldown_s: f64,
    /// Frames inside the gate's x-window before a track may count.
    pub min_track_age: u32,
    /// Swap the sign of every emitted delta.
    pub invert_direction: bool,
    /// Velocity-sign fallback for tracks first seen inside the band.
    pub born_in_band_fallback: bool,
    /// Forget per-gate state for tracks unseen this long.
    pub state_ttl_s: f64,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            reference_mode: ReferenceMode::TopQuarter,
            reference_fraction: 0.25,
            hysteresis: 2.0,
            min_speed: 1.0,
            max_speed: None,
            cooldown_s: 0.0,
            min_track_age: 2,
            invert_direction: false,
            born_in_band_fallback: true,
            state_ttl_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_box_w: f32,
    pub min_box_h: f32,
    pub max_aspect_ratio: f32,
    /// Accepted class ids; empty accepts every class.
    pub allowed_classes: Vec<i64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_box_w: 12.0,
            min_box_h: 12.0,
            max_aspect_ratio: 5.0,
            allowed_classes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum centroid distance (px) for a detection to continue a track.
    pub max_distance: f32,
    /// Frames a track survives without a match.
    pub max_age: u32,
    /// First identity handed out; keeps assigned ids clear of supplied ones.
    pub id_base: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 80.0,
            max_age: 20,
            id_base: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl ScanRegion {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Seconds of population scanning at startup; 0 disables the phase.
    pub duration_s: f64,
    pub offset: i64,
    pub scan_region: ScanRegion,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            duration_s: 0.0,
            offset: 0,
            scan_region: ScanRegion {
                x1: 0.0,
                y1: 0.0,
                x2: 1920.0,
                y2: 1080.0,
            },
        }
    }
}

impl BootstrapConfig {
    pub fn is_enabled(&self) -> bool {
        self.duration_s > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub state_path: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./state/last.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    /// Empty keeps the outbox local-only.
    pub ingest_url: String,
    pub api_key: String,
    pub batch_size: usize,
    pub poll_interval_s: f64,
    pub backoff_s: f64,
    pub request_timeout_s: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./edge_data/edge_events.db"),
            ingest_url: String::new(),
            api_key: String::new(),
            batch_size: 50,
            poll_interval_s: 10.0,
            backoff_s: 10.0,
            request_timeout_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub event_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            event_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub interval_s: f64,
    pub path: Option<PathBuf>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_s: 30.0,
            path: None,
        }
    }
}

fn default_gates() -> Vec<GateConfig> {
    vec![
        GateConfig {
            name: "G1".to_string(),
            boundary_a: 85.0,
            boundary_b: 124.0,
            xmin: 484.0,
            xmax: 573.0,
        },
        GateConfig {
            name: "G2".to_string(),
            boundary_a: 109.0,
            boundary_b: 153.0,
            xmin: 1464.0,
            xmax: 1558.0,
        },
    ]
}

impl Config {
    /// Load a YAML config. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|key| std::env::var(key).ok());
    }

    /// Apply the EDGE_* overrides using an arbitrary lookup.
    pub fn apply_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EDGE_DB_PATH") {
            self.relay.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EDGE_INGEST_URL") {
            self.relay.ingest_url = v;
        }
        if let Some(v) = lookup("EDGE_LOT_ID") {
            self.site.lot_id = v;
        }
        if let Some(v) = lookup("EDGE_CAMERA_ID") {
            self.site.camera_id = v;
        }
        if let Some(v) = lookup("EDGE_API_KEY") {
            self.relay.api_key = v;
        }
    }

    /// Capacity as the counter's unsigned bound. Only meaningful after `validate`.
    pub fn capacity(&self) -> u32 {
        self.occupancy.capacity.clamp(0, u32::MAX as i64) as u32
    }

    pub fn seed_occupancy(&self) -> u32 {
        self.occupancy.seed_occupancy.clamp(0, u32::MAX as i64) as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_gates()?;

        let occ = &self.occupancy;
        if occ.capacity < 0 || occ.capacity > u32::MAX as i64 {
            return Err(ConfigError::invalid(
                "occupancy.capacity",
                format!("{} out of range", occ.capacity),
            ));
        }
        if occ.seed_occupancy < 0 {
            return Err(ConfigError::invalid(
                "occupancy.seed_occupancy",
                format!("{} is negative", occ.seed_occupancy),
            ));
        }
        if occ.seed_occupancy > occ.capacity {
            return Err(ConfigError::invalid(
                "occupancy.seed_occupancy",
                format!("{} exceeds capacity {}", occ.seed_occupancy, occ.capacity),
            ));
        }

        let c = &self.crossing;
        if !(c.hysteresis >= 0.0 && c.hysteresis.is_finite()) {
            return Err(ConfigError::invalid("crossing.hysteresis", "must be finite and >= 0"));
        }
        if !(c.min_speed >= 0.0 && c.min_speed.is_finite()) {
            return Err(ConfigError::invalid("crossing.min_speed", "must be finite and >= 0"));
        }
        if let Some(max) = c.max_speed {
            if !(max > 0.0) {
                return Err(ConfigError::invalid("crossing.max_speed", "must be > 0"));
            }
            if max < c.min_speed {
                return Err(ConfigError::invalid(
                    "crossing.max_speed",
                    format!("{} is below min_speed {}", max, c.min_speed),
                ));
            }
        }
        if !(c.cooldown_s >= 0.0 && c.cooldown_s.is_finite()) {
            return Err(ConfigError::invalid("crossing.cooldown_s", "must be finite and >= 0"));
        }
        if !(c.state_ttl_s > 0.0 && c.state_ttl_s.is_finite()) {
            return Err(ConfigError::invalid("crossing.state_ttl_s", "must be finite and > 0"));
        }
        if c.reference_mode == ReferenceMode::Fraction && !(0.0..=1.0).contains(&c.reference_fraction) {
            return Err(ConfigError::invalid(
                "crossing.reference_fraction",
                format!("{} outside [0, 1]", c.reference_fraction),
            ));
        }

        if !(self.filter.max_aspect_ratio >= 1.0) {
            return Err(ConfigError::invalid("filter.max_aspect_ratio", "must be >= 1"));
        }
        if self.filter.min_box_w < 0.0 || self.filter.min_box_h < 0.0 {
            return Err(ConfigError::invalid("filter.min_box", "must be >= 0"));
        }

        if !(self.tracker.max_distance > 0.0) {
            return Err(ConfigError::invalid("tracker.max_distance", "must be > 0"));
        }

        let b = &self.bootstrap;
        if !(b.duration_s >= 0.0 && b.duration_s.is_finite()) {
            return Err(ConfigError::invalid("bootstrap.duration_s", "must be finite and >= 0"));
        }
        if b.is_enabled() {
            let r = &b.scan_region;
            if !(r.x2 > r.x1 && r.y2 > r.y1) {
                return Err(ConfigError::invalid(
                    "bootstrap.scan_region",
                    "x2 > x1 and y2 > y1 required",
                ));
            }
        }

        let r = &self.relay;
        if r.batch_size == 0 {
            return Err(ConfigError::invalid("relay.batch_size", "must be > 0"));
        }
        check_interval("relay.poll_interval_s", r.poll_interval_s)?;
        check_interval("relay.backoff_s", r.backoff_s)?;
        check_interval("relay.request_timeout_s", r.request_timeout_s)?;
        check_interval("status.interval_s", self.status.interval_s)?;

        info!(
            "✓ Configuration valid: {} gate(s), capacity={}",
            self.gates.len(),
            self.occupancy.capacity
        );
        Ok(())
    }

    fn validate_gates(&self) -> Result<(), ConfigError> {
        if self.gates.is_empty() {
            return Err(ConfigError::NoGates);
        }
        let mut names = HashSet::new();
        for gate in &self.gates {
            if !names.insert(gate.name.as_str()) {
                return Err(ConfigError::DuplicateGate(gate.name.clone()));
            }
            let degenerate = |reason: String| ConfigError::DegenerateGate {
                name: gate.name.clone(),
                reason,
            };
            let coords = [gate.boundary_a, gate.boundary_b, gate.xmin, gate.xmax];
            if coords.iter().any(|v| !v.is_finite()) {
                return Err(degenerate("non-finite coordinate".to_string()));
            }
            if gate.boundary_a == gate.boundary_b {
                return Err(degenerate(format!(
                    "boundaries A and B are both {}",
                    gate.boundary_a
                )));
            }
            if gate.xmin >= gate.xmax {
                return Err(degenerate(format!(
                    "xmin {} must be below xmax {}",
                    gate.xmin, gate.xmax
                )));
            }
        }
        Ok(())
    }
}

/// Intervals end up in `Duration::from_secs_f64`, which panics on
/// non-finite or overflowing input.
fn check_interval(field: &'static str, seconds: f64) -> Result<(), ConfigError> {
    if !(seconds > 0.0 && seconds <= MAX_INTERVAL_S) {
        return Err(ConfigError::invalid(
            field,
            format!("{} outside (0, {}] seconds", seconds, MAX_INTERVAL_S),
        ));
    }
    Ok(())
}
