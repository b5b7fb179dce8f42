//! HTTP surface for the operator console and gallery views.

use crate::blob_store::content_type_for;
use crate::config::ApiConfig;
use crate::document_store::{DocPath, DocumentStore};
use crate::error::BoothError;
use crate::gallery::{DeleteReport, Gallery, GalleryPage, LAST_SYNC_ID, METADATA_COLLECTION};
use crate::resource_lock::{LockRecord, ResourceLock};
use crate::themes::{Theme, ThemeService};
use crate::trigger::{TriggerChannel, TriggerRecord};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub docs: Arc<dyn DocumentStore>,
    pub lock: Arc<ResourceLock>,
    pub trigger: TriggerChannel,
    pub gallery: Arc<Gallery>,
    pub themes: Arc<ThemeService>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for BoothError {
    fn into_response(self) -> Response {
        let status = match &self {
            BoothError::Contention { .. } | BoothError::TransactionConflict { .. } => StatusCode::CONFLICT,
            BoothError::Device(_) | BoothError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            BoothError::Validation(_) => StatusCode::BAD_REQUEST,
            BoothError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, BoothError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub file_path: String,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub message: String,
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Deserialize)]
pub struct DeleteImagesRequest {
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GalleryQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct NewThemeRequest {
    pub content: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload", post(upload))
        .route("/reset", post(reset_trigger))
        .route("/synchronize", get(synchronize))
        .route("/images", get(list_images))
        .route("/images/delete", post(delete_images))
        .route("/themes", get(list_themes).post(add_theme))
        .route("/themes/:id", delete(delete_theme))
        .route("/trigger", get(get_trigger).put(put_trigger))
        .route("/lock", get(get_lock))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "booth-service"
    }))
}

/// Ready once the document store answers.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state
        .docs
        .get(&DocPath::new(METADATA_COLLECTION, LAST_SYNC_ID))
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "documentStore": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "documentStore": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state, multipart))]
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<UploadResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BoothError::Validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = match field.content_type() {
            Some(ct) => ct.to_string(),
            None => {
                let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
                content_type_for(extension).to_string()
            }
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| BoothError::Validation(format!("failed to read upload: {e}")))?;

        let file_path = state.gallery.upload_raw(&file_name, data, &content_type).await?;
        return Ok(Json(UploadResponse {
            message: "File uploaded successfully".to_string(),
            file_path,
        }));
    }

    Err(BoothError::Validation("No file uploaded".to_string()))
}

async fn reset_trigger(State(state): State<AppState>) -> ApiResult<TriggerRecord> {
    state.trigger.reset_take_photo().await?;
    Ok(Json(state.trigger.current().await?))
}

async fn synchronize(State(state): State<AppState>) -> ApiResult<SyncResponse> {
    let report = state.gallery.synchronize().await?;
    Ok(Json(SyncResponse {
        message: "Synchronization completed successfully".to_string(),
        added: report.added,
        deleted: report.deleted,
    }))
}

async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<GalleryQuery>,
) -> ApiResult<GalleryPage> {
    Ok(Json(state.gallery.list(params.limit, params.offset).await?))
}

async fn delete_images(
    State(state): State<AppState>,
    Json(request): Json<DeleteImagesRequest>,
) -> ApiResult<DeleteReport> {
    let report = state.gallery.delete_batch(request.paths).await?;
    if report.failed_count > 0 {
        warn!(failed_count = report.failed_count, "Some images could not be deleted");
    }
    Ok(Json(report))
}

async fn list_themes(State(state): State<AppState>) -> ApiResult<Vec<Theme>> {
    Ok(Json(state.themes.list().await?))
}

async fn add_theme(
    State(state): State<AppState>,
    Json(request): Json<NewThemeRequest>,
) -> Result<(StatusCode, Json<Theme>), BoothError> {
    let theme = state.themes.add(&request.content).await?;
    Ok((StatusCode::CREATED, Json(theme)))
}

async fn delete_theme(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, BoothError> {
    state.themes.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_trigger(State(state): State<AppState>) -> ApiResult<TriggerRecord> {
    Ok(Json(state.trigger.current().await?))
}

async fn put_trigger(
    State(state): State<AppState>,
    Json(record): Json<TriggerRecord>,
) -> ApiResult<TriggerRecord> {
    Ok(Json(state.trigger.publish(record).await?))
}

/// An absent record reads as unlocked.
async fn get_lock(State(state): State<AppState>) -> ApiResult<LockRecord> {
    Ok(Json(state.lock.current().await?.unwrap_or_default()))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting booth API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
