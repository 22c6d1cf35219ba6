//! Multimodal generation endpoints under `/vlm`.

mod dto;
mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/vlm", get(handlers::root))
        .route("/vlm/", get(handlers::root))
        .route("/vlm/health", get(handlers::health))
        .route("/vlm/generate", post(handlers::generate))
        .route("/vlm/generate/stream", post(handlers::generate_stream))
        .route("/vlm/generate/image", post(handlers::generate_with_image))
        .route("/vlm/clear", post(handlers::clear))
        .route("/vlm/conversation/history", get(handlers::history))
        .route("/vlm/prompts", get(handlers::prompts))
}
