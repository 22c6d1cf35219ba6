use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use vlm_core::ServerConfig;

use crate::state::AppState;

/// Headroom for JSON framing and multipart boundaries on top of the media ceilings.
const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Create the main API router.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let media = &state.service.config().media;
    // Base64 inflates payloads by 4/3.
    let body_limit = (media.max_image_bytes + media.max_audio_bytes) / 3 * 4 + BODY_OVERHEAD_BYTES;

    Router::new()
        .merge(crate::api::internal::router())
        .merge(crate::api::vlm::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{origin}'");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}
