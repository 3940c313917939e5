use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    codec::{self, ImagePayload},
    error::GenerationError,
    models::{
        GenerateRequest, ImageResponse, MaskResponse, SessionView, StrokeRequest, StyleQuery, StylesResponse,
        SuggestionQuery, UploadRequest, ViewAngle,
    },
    orchestrator::Orchestrator,
    session::{Session, SessionStore},
    styles::{self, StylePreset},
};

#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub orchestrator: Arc<Orchestrator>,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/image", put(replace_image))
        .route("/api/sessions/:id/reference", put(set_reference).delete(clear_reference))
        .route("/api/sessions/:id/generate", post(generate_front))
        .route("/api/sessions/:id/views/:angle", post(generate_view))
        .route("/api/sessions/:id/reset", post(reset_session))
        .route("/api/sessions/:id/mask", get(export_mask).delete(clear_mask))
        .route("/api/sessions/:id/mask/strokes", post(paint_stroke))
        .route("/api/sessions/:id/mask/auto", post(auto_mask))
        .route("/api/styles", get(list_styles))
        .route("/api/suggestions", get(suggestions))
        .route("/api/trending", get(trending))
        .layer(body_limit)
        .with_state(state)
}

/// Error body returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Generation { error: GenerationError, message: String },
    Internal(String),
}

impl From<GenerationError> for ApiError {
    fn from(error: GenerationError) -> Self {
        let message = error.to_string();
        ApiError::Generation { error, message }
    }
}

impl ApiError {
    fn user_facing(error: GenerationError, angle: Option<ViewAngle>) -> Self {
        let message = error.user_message(angle);
        ApiError::Generation { error, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, retryable) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", format!("{what} not found"), false),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message, false),
            ApiError::Generation { error, message } => {
                let status = match &error {
                    GenerationError::InvalidImageFormat | GenerationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    GenerationError::PreconditionViolation(_)
                    | GenerationError::AngleBusy(_)
                    | GenerationError::Superseded
                    | GenerationError::Cancelled => StatusCode::CONFLICT,
                    GenerationError::TransientCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
                    GenerationError::Mask(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, error.kind(), message, error.is_retryable())
            }
        };
        (status, Json(json!({ "error": message, "kind": kind, "retryable": retryable }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn with_session<T>(state: &AppState, id: Uuid, f: impl FnOnce(&mut Session) -> T) -> Result<T, ApiError> {
    let mut guard = state.store.write();
    let session = guard.get_mut(&id).ok_or(ApiError::NotFound("session"))?;
    Ok(f(session))
}

/// Drives a generation on its own task. The task commits or fails its
/// ticket even if the client disconnects and this handler is dropped.
async fn run_to_completion<F>(generation: F) -> Result<ImagePayload, ApiError>
where
    F: Future<Output = Result<ImagePayload, ApiError>> + Send + 'static,
{
    tokio::spawn(generation)
        .await
        .map_err(|e| ApiError::Internal(format!("generation task failed: {e}")))?
}

/// Runs face analysis in the background; the result lands on the session
/// only if the upload has not changed meanwhile.
fn spawn_analysis(state: &AppState, id: Uuid) {
    let Ok(ticket) = with_session(state, id, |s| s.begin_analysis()) else { return };
    let state = state.clone();
    tokio::spawn(async move {
        let result = state.orchestrator.analyze(&ticket.source, &ticket.cancel).await;
        let applied = with_session(&state, id, |s| s.finish_analysis(&ticket, result)).unwrap_or(false);
        if !applied {
            tracing::info!(session = %id, "Discarding analysis for a replaced upload");
        }
    });
}

pub async fn create_session(State(state): State<AppState>, Json(body): Json<UploadRequest>) -> ApiResult<SessionView> {
    let source = codec::decode(&body.image)?;
    let session = Session::new(source)?;
    let id = session.id;
    let view = session.view();
    tracing::info!(session = %id, "📸 New upload: {}", session.source().summary());
    state.store.write().insert(id, session);
    spawn_analysis(&state, id);
    Ok(Json(view))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<SessionView> {
    Ok(Json(with_session(&state, id, |s| s.view())?))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let session = state.store.write().remove(&id).ok_or(ApiError::NotFound("session"))?;
    session.shutdown();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_image(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> ApiResult<SessionView> {
    let source = codec::decode(&body.image)?;
    let view = with_session(&state, id, |s| s.replace_source(source).map(|_| s.view()))??;
    spawn_analysis(&state, id);
    Ok(Json(view))
}

pub async fn set_reference(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> ApiResult<SessionView> {
    let reference = codec::decode(&body.image)?;
    Ok(Json(with_session(&state, id, |s| {
        s.set_reference(Some(reference));
        s.view()
    })?))
}

pub async fn clear_reference(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<SessionView> {
    Ok(Json(with_session(&state, id, |s| {
        s.set_reference(None);
        s.view()
    })?))
}

pub async fn generate_front(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> ApiResult<ImageResponse> {
    let prompt = match (&body.style_id, &body.prompt) {
        (Some(style_id), _) => styles::find(style_id).ok_or(ApiError::NotFound("style"))?.prompt.to_string(),
        (None, Some(prompt)) => prompt.clone(),
        (None, None) => String::new(),
    };
    let ticket = with_session(&state, id, |s| s.begin_front(&prompt, body.use_reference))??;

    let task_state = state.clone();
    let image = run_to_completion(async move {
        let result = task_state.orchestrator.generate_front(&ticket).await;
        with_session(&task_state, id, |s| match result {
            Ok(image) => s.commit_front(&ticket, image.clone()).map(|_| image).map_err(ApiError::from),
            Err(err) => {
                s.fail_front(&ticket, &err);
                Err(ApiError::user_facing(err, None))
            }
        })?
    })
    .await?;
    Ok(Json(ImageResponse { angle: ViewAngle::Front, image: image.to_data_url() }))
}

pub async fn generate_view(
    Path((id, angle)): Path<(Uuid, ViewAngle)>,
    State(state): State<AppState>,
) -> ApiResult<ImageResponse> {
    // Already generated for the current front: just hand it back.
    if let Some(existing) = with_session(&state, id, |s| s.views().get(angle).map(|img| img.to_data_url()))? {
        return Ok(Json(ImageResponse { angle, image: existing }));
    }
    let ticket = with_session(&state, id, |s| s.begin_angle(angle))??;

    let task_state = state.clone();
    let image = run_to_completion(async move {
        let result = task_state.orchestrator.generate_angle(&ticket).await;
        with_session(&task_state, id, |s| match result {
            Ok(image) => s.commit_angle(&ticket, image.clone()).map(|_| image).map_err(ApiError::from),
            Err(err) => {
                s.fail_angle(&ticket, &err);
                Err(ApiError::user_facing(err, Some(angle)))
            }
        })?
    })
    .await?;
    Ok(Json(ImageResponse { angle, image: image.to_data_url() }))
}

pub async fn reset_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<SessionView> {
    Ok(Json(with_session(&state, id, |s| {
        s.reset();
        s.view()
    })?))
}

pub async fn paint_stroke(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<StrokeRequest>,
) -> ApiResult<SessionView> {
    let view = with_session(&state, id, |s| {
        s.mask_mut().paint_stroke(&body.points, body.tool, body.brush_size).map(|_| s.view())
    })??;
    Ok(Json(view))
}

pub async fn clear_mask(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<SessionView> {
    Ok(Json(with_session(&state, id, |s| {
        s.mask_mut().clear();
        s.view()
    })?))
}

pub async fn export_mask(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<MaskResponse> {
    let mask = with_session(&state, id, |s| s.mask().is_set().then(|| s.mask().export()))?
        .ok_or(ApiError::NotFound("mask"))??;
    Ok(Json(MaskResponse { mask: mask.to_data_url() }))
}

pub async fn auto_mask(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<MaskResponse> {
    let ticket = with_session(&state, id, |s| s.begin_mask_detection())?;
    let mask = state.orchestrator.detect_hair_mask(&ticket).await?;
    let exported = mask.export()?;
    with_session(&state, id, |s| s.commit_mask(&ticket, mask))??;
    Ok(Json(MaskResponse { mask: exported.to_data_url() }))
}

pub async fn list_styles(Query(query): Query<StyleQuery>) -> Json<Vec<StylePreset>> {
    Json(styles::presets(query.category))
}

pub async fn suggestions(State(state): State<AppState>, Query(query): Query<SuggestionQuery>) -> Json<StylesResponse> {
    Json(StylesResponse { styles: state.orchestrator.suggest_styles(&query.q).await })
}

pub async fn trending(State(state): State<AppState>) -> Json<StylesResponse> {
    Json(StylesResponse { styles: state.orchestrator.trending_styles().await })
}
