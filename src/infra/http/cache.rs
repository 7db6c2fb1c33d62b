use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use crate::{
    application::{data::validate_key, error::HttpError},
    cache::CacheStats,
};

use super::HttpState;

const SOURCE: &str = "infra::http::cache";

/// Either an exact key or a prefix, never both.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(super) struct InvalidateRequest {
    key: Option<String>,
    prefix: Option<String>,
}

pub(super) async fn cache_stats(State(state): State<HttpState>) -> Json<CacheStats> {
    Json(state.data.cache().json_stats())
}

pub(super) async fn invalidate_cache(
    State(state): State<HttpState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<StatusCode, HttpError> {
    let cache = state.data.cache();
    match (request.key, request.prefix) {
        (Some(key), None) => {
            validate_key(&key).map_err(|err| {
                HttpError::new(SOURCE, StatusCode::BAD_REQUEST, "Invalid key", err.to_string())
            })?;
            let removed = cache.invalidate(&key);
            info!(cache_key = %key, removed, "Cache key invalidated via API");
        }
        (None, Some(prefix)) if !prefix.is_empty() => {
            let removed = cache.invalidate_by_prefix(&prefix);
            info!(prefix = %prefix, removed = removed.len(), "Cache prefix invalidated via API");
        }
        _ => {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Provide exactly one of `key` or a non-empty `prefix`",
                "invalidate request must name exactly one of key or prefix",
            ));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn clear_cache(State(state): State<HttpState>) -> Response {
    let dropped = state.data.cache().clear();
    info!(dropped, "Cache cleared via API");
    StatusCode::NO_CONTENT.into_response()
}
