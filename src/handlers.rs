use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::agents::PipelineHandle;
use crate::error::*;
use crate::models::*;
use crate::multiplexer::{EVENT_STREAM_CONTENT_TYPE, EventMultiplexer};
use crate::splitter::split_owned;
use crate::storage::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/agent-survey",
            axum::routing::post(survey_stream_handler),
        )
        .route(
            "/api/agent-survey/{request_id}",
            axum::routing::delete(cancel_handler),
        )
        .route("/health", axum::routing::get(health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)]),
        )
        .with_state(state)
}

// ============================================================================
// SURVEY STREAM HANDLER
// ============================================================================

/// Streams the narrative summary of one survey.
///
/// POST /api/agent-survey
/// Body: `{"sid": "123456"}`
///
/// Everything that can fail before the pipeline starts is answered with a
/// JSON error and no stream; a caller-supplied `X-Request-ID` is echoed in
/// that body. Once streaming, failures arrive as an `error` frame.
pub async fn survey_stream_handler(
    State(state): State<Arc<AppState>>,
    request_headers: HeaderMap,
    payload: std::result::Result<Json<SurveyRequest>, JsonRejection>,
) -> Response {
    let handle = match start_survey_pipeline(&state, payload).await {
        Ok(handle) => handle,
        Err(e) => {
            log_error(&e);
            let mut body = ErrorResponse::new(e);
            if let Some(id) = request_headers
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                body = body.with_request_id(id.to_string());
            }
            return body.into_response();
        }
    };

    let request_id = handle.request_id.clone();
    let body = Body::from_stream(EventMultiplexer::new().into_body_stream(handle));

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Validate, fetch, split, start.
async fn start_survey_pipeline(
    state: &AppState,
    payload: std::result::Result<Json<SurveyRequest>, JsonRejection>,
) -> Result<PipelineHandle> {
    let sid = payload
        .map_err(|rejection| AppError::validation(rejection.body_text()))
        .and_then(|Json(request)| request.validate())?;

    let record = state.store.fetch_survey_summary(&sid).await?;

    let split = split_owned(record);
    log::info!(
        "Survey {}: {} rating questions, {} free-text questions",
        sid,
        split.ratings_only.len(),
        split.free_text_only.len()
    );

    Ok(state.pipeline.start(split.free_text_only).await)
}

// ============================================================================
// CANCEL HANDLER
// ============================================================================

/// DELETE /api/agent-survey/{request_id}
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    if state.pipeline.cancel_request(&request_id).await {
        log::info!("[{}] Cancelled by client", request_id);
        Ok(Json(CancelResponse {
            success: true,
            message: format!("Request {} cancelled successfully", request_id),
            request_id,
        }))
    } else {
        Err(AppError::not_found(format!("Request {}", request_id)))
    }
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus::healthy())
}
