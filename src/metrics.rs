use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    /// Dispatched calls by backend, operation and outcome
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_requests_total",
        "Total number of dispatched requests",
        &["provider", "operation", "status"]
    )
    .unwrap();

    /// Time until the backend answered (first byte for streams)
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "gateway_request_duration_seconds",
        "Backend call duration in seconds",
        &["provider", "stream"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub static ref TOKENS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_tokens_total",
        "Total number of tokens reported by backends",
        &["provider", "type"]
    )
    .unwrap();

    pub static ref STREAM_CHUNKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_stream_chunks_total",
        "Canonical chunks emitted to callers",
        &["provider"]
    )
    .unwrap();

    /// Native frames that could not be parsed and were skipped
    pub static ref SKIPPED_FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_skipped_frames_total",
        "Malformed stream frames skipped",
        &["provider"]
    )
    .unwrap();

    pub static ref DROPPED_IMAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_dropped_image_parts_total",
        "Image parts dropped during normalization",
        &["reason"]
    )
    .unwrap();

    pub static ref AUTH_ERRORS: IntCounterVec = register_int_counter_vec!(
        "gateway_auth_errors_total",
        "Total number of authentication errors",
        &["type"]
    )
    .unwrap();
}

pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub async fn metrics_handler() -> axum::response::Response {
    match export_metrics() {
        Ok(metrics) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics,
        )
            .into_response(),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        )
            .into_response(),
    }
}
