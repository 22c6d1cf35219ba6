//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    /// Machine-readable `type` in the response body
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.status.as_str()
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<vlm_core::Error> for ApiError {
    fn from(err: vlm_core::Error) -> Self {
        use vlm_core::Error;

        let status = match &err {
            Error::InvalidRequest(_)
            | Error::InvalidMedia(_)
            | Error::ConversionFailed(_)
            | Error::MediaProcessingFailed(_) => StatusCode::BAD_REQUEST,
            Error::ServiceUnavailable(_) | Error::ModelLoadError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::GenerationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_status_codes() {
        let cases = [
            (vlm_core::Error::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                vlm_core::Error::MediaProcessingFailed("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                vlm_core::Error::ServiceUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                vlm_core::Error::GenerationTimeout("x".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                vlm_core::Error::GenerationFailed("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                vlm_core::Error::PromptFormattingFailed("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn error_type_follows_the_core_error_kind() {
        let err = ApiError::from(vlm_core::Error::GenerationTimeout("slow".into()));
        assert_eq!(err.kind, "generation_timeout");
        assert_eq!(
            ApiError::from(vlm_core::Error::InvalidMedia("x".into())).kind,
            "media_processing_failed"
        );
        assert_eq!(ApiError::bad_request("x").kind, "invalid_request");
    }

    #[tokio::test]
    async fn response_body_carries_type_and_code() {
        let response = ApiError::from(vlm_core::Error::GenerationTimeout("slow".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "generation_timeout");
        assert_eq!(body["error"]["code"], "504");
    }
}
