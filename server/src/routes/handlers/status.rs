use axum::{extract::State, Json};
use serde::Serialize;

use crate::{
    observability::{PipelineStats, SessionPhase},
    state::drain::DrainPhase,
    ServerState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub session: SessionPhase,
    pub watermark: u32,
    pub queue_length: usize,
    pub index_retry: usize,
    pub drain: DrainPhase,
    pub oracle: String,
    pub channels: Vec<String>,
    pub feed_subscribers: usize,
    pub pipeline: PipelineStats,
}

/// # GET /status
pub async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        session: state.tracker.phase(),
        watermark: state.sync_state.last_seen_uid(),
        queue_length: state.sync_state.queue_len(),
        index_retry: state.sync_state.index_retry_len(),
        drain: state.drain.phase(),
        oracle: state.rate_limiters.get_status(),
        channels: state.dispatcher.channel_names(),
        feed_subscribers: state.feed.subscriber_count(),
        pipeline: state.tracker.get_stats(),
    })
}
