// src/analysis/mod.rs
//
// Per-frame analysis modules.
//
// Signal flow:
//   Detections (no id) → identity_tracker ─┐
//   Detections (with id) ───────────────────┼→ bootstrap  (window open)
//                                           └→ crossing (gate) → CrossingDecision
//
// Orchestrated by pipeline::OccupancyPipeline.

pub mod bootstrap;
pub mod crossing;
pub mod gate;
pub mod identity_tracker;

pub use bootstrap::{BootstrapEstimator, BootstrapStatus};
pub use crossing::{CrossingDecision, CrossingEngine, CrossingState, CrossingTable, EmissionRule};
pub use gate::{reference_y, Gate, GateBank};
pub use identity_tracker::IdentityTracker;
