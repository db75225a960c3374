//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
        Multipart, State,
    },
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;

use super::auth::RequestId;
use super::server::AppState;
use super::types::{AudioUpload, ChatCompletionRequest, ModelList};
use crate::error::Error;
use crate::relay::{self, Passthrough};

/// Attempts the dispatcher needed for this response.
pub const ATTEMPTS_HEADER: HeaderName = HeaderName::from_static("x-proxyrelay-attempts");

/// Upstream task used when a transcription request names none.
const DEFAULT_TASK: &str = "transcribe";

fn attach_attempts(response: &mut Response, attempts: u32) {
    response
        .headers_mut()
        .insert(ATTEMPTS_HEADER, HeaderValue::from(attempts));
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let permit = Arc::clone(&state.chat_permits)
        .try_acquire_owned()
        .map_err(|_| Error::Overloaded)?;

    let Json(mut request) = payload.map_err(|e| Error::BadRequest(e.body_text()))?;
    request.validate().map_err(Error::BadRequest)?;

    if !state.models.is_supported(&request.model) {
        return Err(Error::ModelNotFound {
            model: request.model,
        });
    }
    request.apply_defaults();

    tracing::info!(
        request_id = %request_id,
        model = %request.model,
        stream = request.stream,
        "Received chat completion request"
    );

    let policy = state
        .config
        .dispatch
        .chat
        .policy(state.config.pool.empty_backoff());
    let timeout = policy.attempt_timeout;
    let request = &request;

    if request.stream {
        let dispatched = state
            .dispatcher
            .dispatch(&policy, |proxy| {
                let upstream = Arc::clone(&state.upstream);
                async move {
                    let response = upstream.chat(&proxy, request, timeout).await?;
                    relay::prime(relay::sse_frames(response.bytes_stream())).await
                }
            })
            .await?;

        tracing::info!(
            request_id = %request_id,
            attempts = dispatched.attempts,
            "Streaming chat completion"
        );

        let pool = Arc::clone(&state.pool);
        let proxy = dispatched.proxy;
        let on_error = move |err: &relay::RelayError| {
            tracing::warn!(
                request_id = %request_id,
                proxy = %proxy,
                error = %err,
                "Stream failed after commit, evicting proxy"
            );
            pool.evict(&proxy);
        };

        // The permit stays held until the client has the whole stream; each
        // later frame gets the attempt timeout as its idle bound.
        let mut response =
            relay::event_stream_response(dispatched.value, timeout, on_error, permit);
        attach_attempts(&mut response, dispatched.attempts);
        return Ok(response);
    }

    let dispatched = state
        .dispatcher
        .dispatch(&policy, |proxy| {
            let upstream = Arc::clone(&state.upstream);
            async move {
                let response = upstream.chat(&proxy, request, timeout).await?;
                relay::read_json(response).await
            }
        })
        .await?;
    drop(permit);

    tracing::info!(
        request_id = %request_id,
        attempts = dispatched.attempts,
        bytes = dispatched.value.len(),
        "Chat completion relayed"
    );

    let mut response = relay::json_response(dispatched.value);
    attach_attempts(&mut response, dispatched.attempts);
    Ok(response)
}

async fn field_text(field: Field<'_>) -> Result<String, Error> {
    field
        .text()
        .await
        .map_err(|e| Error::BadRequest(e.body_text()))
}

/// Collect the multipart form into an [`AudioUpload`].
///
/// The audio may come as `file` (OpenAI clients) or `audio`. `model` is only
/// honoured when it names an upstream model (`org/name`); OpenAI aliases such
/// as `whisper-1` fall back to the configured default.
async fn read_upload(mut multipart: Multipart) -> Result<AudioUpload, Error> {
    let mut audio: Option<(Bytes, String, Option<String>)> = None;
    let mut model = None;
    let mut task = None;
    let mut language = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "audio" => {
                let file_name = field.file_name().unwrap_or("audio").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::BadRequest(e.body_text()))?;
                audio = Some((data, file_name, content_type));
            }
            "model" => model = Some(field_text(field).await?),
            "task" => task = Some(field_text(field).await?),
            "language" => language = Some(field_text(field).await?),
            _ => {}
        }
    }

    let (audio, file_name, content_type) = audio
        .filter(|(data, _, _)| !data.is_empty())
        .ok_or_else(|| Error::BadRequest("an audio file is required in field 'file'".to_string()))?;

    Ok(AudioUpload {
        audio,
        file_name,
        content_type,
        model: model.filter(|m| m.contains('/')),
        task: task
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TASK.to_string()),
        language: language.filter(|l| !l.trim().is_empty()),
    })
}

/// Handle POST /v1/audio/transcriptions
pub async fn transcriptions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, Error> {
    let multipart = multipart.map_err(|e| Error::BadRequest(e.body_text()))?;
    let upload = read_upload(multipart).await?;

    tracing::info!(
        request_id = %request_id,
        bytes = upload.audio.len(),
        model = upload.model.as_deref().unwrap_or(&state.config.upstream.transcription_model),
        "Received transcription request"
    );

    let policy = state
        .config
        .dispatch
        .transcription
        .policy(state.config.pool.empty_backoff());
    let timeout = policy.attempt_timeout;
    let upload = &upload;

    let dispatched = state
        .dispatcher
        .dispatch(&policy, |proxy| {
            let upstream = Arc::clone(&state.upstream);
            async move {
                let response = upstream.transcribe(&proxy, upload, timeout).await?;
                Passthrough::read(response).await
            }
        })
        .await?;

    tracing::info!(
        request_id = %request_id,
        attempts = dispatched.attempts,
        "Transcription relayed"
    );

    let mut response = dispatched.value.into_response();
    attach_attempts(&mut response, dispatched.attempts);
    Ok(response)
}

/// Handle GET /models and GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::from_ids(state.models.models()))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let proxies = state.pool.stats();
    let models = state.models.stats();

    Json(serde_json::json!({
        "status": "ok",
        "service": "proxyrelay",
        "proxies": {
            "available": proxies.size,
            "evictions": proxies.evictions,
            "refreshes": proxies.refreshes,
            "refresh_failures": proxies.refresh_failures,
            "last_refresh": proxies.last_refresh.map(|t| t.to_rfc3339()),
        },
        "models": {
            "enabled": state.models.enabled(),
            "available": models.size,
            "last_refresh": models.last_refresh.map(|t| t.to_rfc3339()),
        },
        "auth": state.config.server.api_key.is_some(),
    }))
}
