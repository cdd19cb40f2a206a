//! Observability Module
//!
//! Pipeline counters, session phase and the periodic status table.

mod pipeline_tracker;

pub use pipeline_tracker::{PipelineStats, PipelineTracker, SessionPhase};
