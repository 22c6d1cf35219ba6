use std::convert::Infallible;
use std::time::Instant;

use axum::{
    extract::{Multipart, Query, State},
    http::{header::HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use base64::Engine;
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use vlm_core::{GenerationRequest, HealthReport, DEFAULT_SESSION, DONE_SENTINEL, ERROR_MARKER};

use super::dto::{
    GenerateRequest, GenerateResponse, MessageResponse, PromptListResponse, ResponseMetadata,
    SessionQuery,
};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "VLM API Server is running".to_string(),
    })
}

/// Health after a readiness check; an idle or failed model gets a load attempt.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.check_health().await)
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let request = build_request(&state, req)?;
    info!(
        %request_id,
        "Generation request: {} chars, image={}, audio={}",
        request.prompt.chars().count(),
        request.image.is_some(),
        request.audio.is_some()
    );

    let _permit = state.acquire_permit().await?;
    let started = Instant::now();
    let output = state.service.generate(request).await.map_err(|e| {
        warn!(%request_id, "Generation failed after {:.2}s: {e}", started.elapsed().as_secs_f32());
        ApiError::from(e)
    })?;

    let request_time_ms = started.elapsed().as_millis() as u64;
    info!(
        %request_id,
        "Generation completed in {request_time_ms}ms, response length {}",
        output.text.len()
    );

    Ok(Json(GenerateResponse {
        generated_text: output.text,
        prompt: output.prompt,
        metadata: ResponseMetadata {
            generation: output.metadata,
            request_time_ms,
            image_size_bytes: None,
        },
    }))
}

/// Server-sent events: one `data:` per fragment, terminated by `[DONE]`.
/// Errors after the stream starts arrive in-band as `Error: ...`.
pub async fn generate_stream(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let request = build_request(&state, req)?;
    info!(
        %request_id,
        "Streaming request: {} chars, image={}, audio={}",
        request.prompt.chars().count(),
        request.image.is_some(),
        request.audio.is_some()
    );

    let permit = state.acquire_owned_permit().await?;
    let mut tokens = state.service.generate_streaming(request).await?;

    let events = async_stream::stream! {
        let _permit = permit;
        let started = Instant::now();
        let mut fragments = 0usize;

        while let Some(token) = tokens.next().await {
            if token == DONE_SENTINEL {
                info!(
                    %request_id,
                    "Streaming completed: {fragments} fragment(s) in {:.2}s",
                    started.elapsed().as_secs_f32()
                );
            } else if token.starts_with(ERROR_MARKER) {
                warn!(%request_id, "Streaming generation error: {token}");
            } else {
                fragments += 1;
            }
            yield Ok::<Event, Infallible>(Event::default().data(event_data(&token)));
        }
    };

    Ok((
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

/// Multipart upload with a `prompt` text field and an `image` file field.
pub async fn generate_with_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let max_image_bytes = state.service.config().media.max_image_bytes;
    let mut request = GenerationRequest::default();
    let mut has_prompt = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "file" => {
                let is_image = field
                    .content_type()
                    .map(|ct| ct.starts_with("image/"))
                    .unwrap_or(false);
                if !is_image {
                    return Err(ApiError::bad_request("File must be an image"));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_field_error(&name, &e.to_string()))?;
                if bytes.len() > max_image_bytes {
                    return Err(ApiError::bad_request(format!(
                        "Image file too large ({} bytes, max {max_image_bytes})",
                        bytes.len()
                    )));
                }
                request.image = Some(bytes.to_vec());
            }
            "prompt" => {
                request.prompt = read_text(field, &name).await?;
                has_prompt = true;
            }
            "prompt_name" => request.prompt_template = Some(read_text(field, &name).await?),
            "session_id" => request.session_id = Some(read_text(field, &name).await?),
            "max_tokens" => request.max_tokens = Some(parse_field(field, &name).await?),
            "temperature" => request.temperature = Some(parse_field(field, &name).await?),
            "top_k" => request.top_k = Some(parse_field(field, &name).await?),
            "top_p" => request.top_p = Some(parse_field(field, &name).await?),
            _ => {}
        }
    }

    if !has_prompt {
        return Err(ApiError::bad_request("Missing 'prompt' field"));
    }
    validate_prompt(&request.prompt, state.service.config().max_prompt_length)?;
    let image_size_bytes = match &request.image {
        Some(image) => image.len(),
        None => return Err(ApiError::bad_request("Missing 'image' file")),
    };
    info!(%request_id, "Image upload request: {image_size_bytes} bytes");

    let _permit = state.acquire_permit().await?;
    let started = Instant::now();
    let output = state.service.generate(request).await?;
    let request_time_ms = started.elapsed().as_millis() as u64;
    info!(%request_id, "Image generation completed in {request_time_ms}ms");

    Ok(Json(GenerateResponse {
        generated_text: output.text,
        prompt: output.prompt,
        metadata: ResponseMetadata {
            generation: output.metadata,
            request_time_ms,
            image_size_bytes: Some(image_size_bytes),
        },
    }))
}

pub async fn clear(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Json<MessageResponse> {
    let session = session_or_default(&query);
    state.service.clear_conversation(session).await;
    Json(MessageResponse {
        message: "Conversation history cleared".to_string(),
    })
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Json<serde_json::Value> {
    let session = session_or_default(&query);
    let history = state.service.conversation_history(session).await;
    Json(json!({
        "session_id": session,
        "conversation_history": history.conversation_history,
        "length": history.length,
        "max_length": history.max_length,
    }))
}

pub async fn prompts(State(state): State<AppState>) -> Json<PromptListResponse> {
    Json(PromptListResponse {
        prompts: state.service.list_prompts().await,
    })
}

/// SSE data fields are split on `\n`; a bare `\r` is not allowed in them.
fn event_data(token: &str) -> String {
    token.replace("\r\n", "\n").replace('\r', "\n")
}

fn session_or_default(query: &SessionQuery) -> &str {
    query
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_SESSION)
}

fn build_request(state: &AppState, req: GenerateRequest) -> Result<GenerationRequest, ApiError> {
    let config = state.service.config();
    validate_prompt(&req.prompt, config.max_prompt_length)?;

    let image = decode_media("image", req.image_base64.as_deref(), config.media.max_image_bytes)?;
    let audio = decode_media("audio", req.audio_base64.as_deref(), config.media.max_audio_bytes)?;

    Ok(GenerationRequest {
        prompt: req.prompt,
        prompt_template: req.prompt_name,
        image,
        audio,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_k: req.top_k,
        top_p: req.top_p,
        session_id: req.session_id,
    })
}

fn validate_prompt(prompt: &str, max_chars: usize) -> Result<(), ApiError> {
    if prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Empty prompt provided"));
    }
    if prompt.chars().count() > max_chars {
        return Err(ApiError::bad_request(format!(
            "Prompt too long (max {max_chars} characters)"
        )));
    }
    Ok(())
}

/// Decode an optional base64 payload, accepting `data:` URLs.
fn decode_media(
    kind: &str,
    encoded: Option<&str>,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, ApiError> {
    let Some(data) = encoded.map(str::trim).filter(|data| !data.is_empty()) else {
        return Ok(None);
    };

    let payload = if data.starts_with("data:") {
        data.split_once(',').map(|(_, b64)| b64).unwrap_or(data)
    } else {
        data
    };
    let normalized: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(normalized.as_bytes())
        .map_err(|e| {
            warn!("Base64 decode error for {kind}: {e}");
            ApiError::bad_request(format!("Invalid base64 {kind} data: {e}"))
        })?;

    if bytes.len() > max_bytes {
        return Err(ApiError::bad_request(format!(
            "{kind} too large ({} bytes, max {max_bytes})",
            bytes.len()
        )));
    }
    Ok(Some(bytes))
}

async fn read_text(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| multipart_field_error(name, &e.to_string()))
}

async fn parse_field<T>(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text = read_text(field, name).await?;
    text.trim()
        .parse::<T>()
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart '{name}' field: {e}")))
}

fn multipart_field_error(field_name: &str, err: &str) -> ApiError {
    ApiError::bad_request(format!(
        "Failed reading multipart '{field_name}' field: {err}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_media_accepts_data_urls_and_skips_empty() {
        let bytes = decode_media("image", Some("data:image/png;base64,aGVs bG8="), 1024).unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"hello"[..]));
        assert!(decode_media("image", Some("  "), 1024).unwrap().is_none());
        assert!(decode_media("image", None, 1024).unwrap().is_none());
    }

    #[test]
    fn decode_media_rejects_bad_payloads() {
        assert!(decode_media("audio", Some("!!!not base64"), 1024).is_err());
        let err = decode_media("audio", Some("aGVsbG8="), 3).unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn carriage_returns_become_line_feeds() {
        assert_eq!(event_data("a\r\nb\rc\nd"), "a\nb\nc\nd");
        assert_eq!(event_data("plain"), "plain");
    }

    #[test]
    fn prompt_validation_counts_characters() {
        assert!(validate_prompt("   ", 10).is_err());
        assert!(validate_prompt("héllo", 5).is_ok());
        assert!(validate_prompt("héllo!", 5).is_err());
    }
}
