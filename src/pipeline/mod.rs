// src/pipeline/mod.rs

pub mod event_bus;
pub mod metrics;
pub mod orchestrator;

pub use event_bus::{EventBus, PipelineEvent, RecentEvents};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use orchestrator::{FrameResult, OccupancyPipeline, PipelineMode, StatusReport};
