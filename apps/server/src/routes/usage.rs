//! Per-user limit and quota visibility.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use murmur_limits::LimitClass;

use crate::state::{caller_from_headers, check_rate, ApiResult, CoreServices};

pub fn router() -> Router<Arc<CoreServices>> {
    Router::new().route("/", get(usage_summary))
}

async fn usage_summary(
    State(services): State<Arc<CoreServices>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let limits = services.rate.status(&caller.user_id);
    let quota = services.quota.summary(&caller.user_id, caller.tier);
    let storage = services.storage.usage();
    services
        .cache
        .set_json(
            &murmur_cache::keys::system_metrics(),
            &storage,
            murmur_cache::Ttl::Default,
        )
        .await;

    Ok(Json(serde_json::json!({
        "limits": limits,
        "quota": quota,
        "storage": storage,
    })))
}
