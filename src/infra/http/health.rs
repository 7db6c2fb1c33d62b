use axum::http::StatusCode;

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
