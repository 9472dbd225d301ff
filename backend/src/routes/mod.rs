pub mod auth;
pub mod images;
pub mod tags;

use axum::Router;
use crate::AppState;

pub fn api_router(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(images::router(max_upload_size))
        .merge(tags::router())
}
