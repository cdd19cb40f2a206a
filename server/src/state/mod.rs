pub mod batcher;
pub mod drain;
pub mod feed;
pub mod orchestrator;
pub mod sync_state;
