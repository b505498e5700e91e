//! HTTP surface assembly.

mod live;
mod transcriptions;
mod uploads;
mod usage;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::CoreServices;

/// Multipart chunk uploads run well past the default body cap.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn app(services: Arc<CoreServices>) -> Router {
    Router::new()
        .nest("/api/uploads", uploads::router())
        .nest("/api/live/sessions", live::router())
        .nest("/api/transcriptions", transcriptions::router())
        .nest("/api/usage", usage::router())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}
