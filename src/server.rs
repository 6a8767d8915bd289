//! HTTP surface: health check and caption upload.
//!
//! The caption handler never lets a failure escape as a transport fault.
//! Whatever goes wrong, the client gets a JSON body with either a `caption`
//! or an `error` key.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::engine::CaptioningEngine;
use crate::error::CaptionError;
use crate::upload::{DecodedImage, UploadedImage};

/// Multipart field the upload is expected under.
pub const UPLOAD_FIELD: &str = "file";

pub const HEALTH_MESSAGE: &str = "Backend is running!";

#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn CaptioningEngine>,
    strict_status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionResult {
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    message: &'static str,
}

/// Builds the application router around an already constructed engine.
pub fn router(engine: Arc<dyn CaptioningEngine>, http: &HttpConfig) -> Router {
    let state = AppState {
        engine,
        strict_status: http.strict_status,
    };

    Router::new()
        .route("/", get(health))
        .route("/generate_caption/", post(generate_caption))
        .route("/generate_caption", post(generate_caption))
        .layer(DefaultBodyLimit::max(http.max_upload_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&http.cors_origins)),
        )
        .with_state(state)
}

/// Every origin, method and header, with credentials.
///
/// A wildcard origin cannot be combined with credentials, so the request's
/// own origin is mirrored back instead. A non-empty `origins` list narrows
/// the allowed origins to exactly those.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::very_permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        message: HEALTH_MESSAGE,
    })
}

async fn generate_caption(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let started = Instant::now();
    let outcome = caption_upload(&state, multipart).await;

    match &outcome {
        Ok(result) => info!(
            engine = state.engine.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            caption = %result.caption,
            "caption generated"
        ),
        Err(err) => warn!(
            engine = state.engine.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "caption request failed"
        ),
    }

    respond(outcome, state.strict_status)
}

async fn caption_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<CaptionResult, CaptionError> {
    let mut multipart = multipart.map_err(|e| CaptionError::Upload(e.to_string()))?;
    let upload = read_upload(&mut multipart).await?;
    debug!(
        bytes = upload.len(),
        content_type = upload.declared_content_type.as_deref().unwrap_or("-"),
        file_name = upload.file_name.as_deref().unwrap_or("-"),
        "upload received"
    );

    let image = tokio::task::spawn_blocking(move || DecodedImage::decode(&upload))
        .await
        .map_err(|e| CaptionError::Decode(format!("decoder worker failed: {e}")))??;

    let caption = state.engine.caption(image).await?;
    let caption = caption.trim();
    if caption.is_empty() {
        return Err(CaptionError::Inference(
            "engine produced an empty caption".to_string(),
        ));
    }

    Ok(CaptionResult {
        caption: caption.to_string(),
    })
}

/// Reads the whole upload into memory.
///
/// The `file` field wins; failing that the first field carrying a filename,
/// failing that the first field at all.
async fn read_upload(multipart: &mut Multipart) -> Result<UploadedImage, CaptionError> {
    let mut fallback: Option<(u8, UploadedImage)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CaptionError::Upload(e.to_string()))?
    {
        let named = field.name() == Some(UPLOAD_FIELD);
        let rank = if named {
            0
        } else if field.file_name().is_some() {
            1
        } else {
            2
        };
        if fallback.as_ref().is_some_and(|(best, _)| *best <= rank) {
            continue;
        }

        let declared_content_type = field.content_type().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| CaptionError::Upload(e.to_string()))?;

        let upload = UploadedImage {
            bytes: bytes.to_vec(),
            declared_content_type,
            file_name,
        };
        if named {
            return Ok(upload);
        }
        fallback = Some((rank, upload));
    }

    fallback
        .map(|(_, upload)| upload)
        .ok_or_else(|| CaptionError::Upload("no file field in upload".to_string()))
}

/// Turns the handler outcome into exactly one response body.
fn respond(outcome: Result<CaptionResult, CaptionError>, strict_status: bool) -> Response {
    let encoded = outcome.and_then(|result| Ok(serde_json::to_vec(&result)?));

    match encoded {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            let status = if strict_status {
                err.status()
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(ErrorResult {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}
