use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::Value;

use crate::{application::error::AppError, cache::CachedValue};

use super::HttpState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct DataQuery {
    refresh: bool,
}

pub(super) async fn page_data(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Query(query): Query<DataQuery>,
) -> Result<Json<CachedValue<Value>>, AppError> {
    let value = state.data.load(&key, query.refresh).await?;
    Ok(Json(value))
}
