//! Chat gateway: one canonical chat model in front of several LLM backends.
//!
//! Callers speak a single OpenAI-shaped dialect; each backend adapter in
//! [`providers`] translates requests, responses and streams in both
//! directions. Library users drive a backend through [`providers::chat`];
//! [`app`] exposes the same over HTTP.

pub mod api;
pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod observability;
pub mod providers;
pub mod routing;
pub mod sse;
pub mod transcoder;

use axum::{
    routing::{any, get},
    Router,
};

pub use error::GatewayError;
pub use routing::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/{provider}/{*path}", any(api::openai::proxy))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
