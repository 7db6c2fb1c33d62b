//! HTTP surface: page data, the live update stream and cache administration.

mod cache;
mod data;
mod health;
mod live;
mod middleware;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{delete, get, post},
};

use crate::{application::data::DataService, live::LiveConfig};

pub use middleware::RequestContext;

#[derive(Clone)]
pub struct HttpState {
    pub data: DataService,
    pub live: LiveConfig,
}

pub fn build_router(state: HttpState) -> Router {
    let api = Router::new()
        .route("/data/{key}", get(data::page_data))
        .route("/live", get(live::live_updates))
        .route("/cache/stats", get(cache::cache_stats))
        .route("/cache/invalidate", post(cache::invalidate_cache))
        .route("/cache", delete(cache::clear_cache));

    Router::new()
        .route("/health", get(health::health))
        .nest("/api", api)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
