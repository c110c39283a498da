//! HTTP handlers: `/ping`, `/metrics`, and the `/stream-query` read
//! surface (§6).

pub mod error;
pub mod stream_query;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use crate::server::AppState;

async fn metrics() -> impl axum::response::IntoResponse {
    let body = crate::metrics::gather();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/metrics", get(metrics))
        .route("/stream-query", get(stream_query::handle))
}
