use axum::{extract::State, response::Response};
use tracing::debug;

use crate::live;

use super::HttpState;

pub(super) async fn live_updates(State(state): State<HttpState>) -> Response {
    let (session_id, response) = live::open(state.data.cache(), state.live);
    debug!(session_id = %session_id, "Live update stream requested");
    response
}
