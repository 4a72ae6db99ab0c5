// src/lib.rs
//
// Edge parking-lot occupancy counter: identity tracking, gate crossing
// detection, bounded occupancy with bootstrap/recovery, and a durable
// outbox relaying every change to a remote aggregator.

pub mod analysis;
pub mod config;
pub mod error;
pub mod input;
pub mod occupancy;
pub mod pipeline;
pub mod recovery;
pub mod relay;
pub mod types;

pub use config::Config;
pub use pipeline::{OccupancyPipeline, PipelineMetrics};
pub use relay::{DeliveryWorker, HttpTransport, Outbox};
