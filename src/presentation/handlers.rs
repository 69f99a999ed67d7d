// HTTP request handlers
use crate::infrastructure::chunked_stream::stream_from_feed;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct SweepProgress<T> {
    completed: usize,
    total: usize,
    records: Vec<T>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Records of the running sweep so far
pub async fn list_records(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let compress = accepts_brotli(&headers);
    let records = state.plot_feed.records().await;
    let progress = SweepProgress {
        completed: records.len(),
        total: state.total_setpoints,
        records,
    };

    match json_response(&progress, compress).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Stream records as they are taken (live plot)
pub async fn stream_records(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let compress = accepts_brotli(&headers);
    stream_from_feed(state.plot_feed.clone(), compress).await
}
