use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::services::ServeDir;

use crate::attribution::{AttributeAnalysisResponse, AttributionPipeline, UploadedImage};
use crate::config::{APP_NAME, Settings};
use crate::error::{ApiError, ApiResult};
use crate::storage::blobs::LOCAL_IMAGES_MOUNT;
use crate::storage::{BlobStore, RecordStore};
use crate::styling::{StylerResponse, StylingPipeline, validate_styling_parameters};

/// Everything the handlers need, wired once in `main`.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub attribution: AttributionPipeline,
    pub styling: StylingPipeline,
    pub records: Arc<RecordStore>,
    pub blobs: Arc<BlobStore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Room for a full batch of maximum-size files plus multipart overhead.
    let body_limit =
        state.settings.max_file_size * state.settings.max_files_per_batch + 1024 * 1024;
    let images_root = state.settings.local_images_root();

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/storage-info", get(storage_info))
        .route(
            "/attribute_clothes",
            post(attribute_clothes).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/styler", post(styler))
        .nest_service(LOCAL_IMAGES_MOUNT, ServeDir::new(images_root))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/attribute_clothes": "POST - Process image files for clothing attribute analysis",
            "/styler": "POST - Generate an outfit recommendation from stored items",
            "/health": "GET - Health check",
            "/storage-info": "GET - Active storage backends",
        },
    }))
}

async fn storage_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = &state.settings;
    let mut info = json!({
        "records_backend": state.records.backend_name(),
        "blobs_backend": state.blobs.backend_name(),
        "save_processed_images": settings.save_processed_images,
        "avoid_duplicates": settings.avoid_duplicates,
        "create_user_subdirs": settings.create_user_subdirs,
    });
    if let Some(map) = info.as_object_mut() {
        if matches!(state.blobs.as_ref(), BlobStore::Remote(_)) {
            map.insert("blob_bucket".to_string(), json!(settings.blob_bucket));
        } else {
            map.insert(
                "user_data_directory".to_string(),
                json!(settings.user_data_dir.display().to_string()),
            );
            map.insert(
                "images_directory".to_string(),
                json!(settings.images_directory),
            );
        }
    }
    Json(info)
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct StylerQuery {
    user_id: Option<String>,
    city: Option<String>,
    weather: Option<String>,
    occasion: Option<String>,
}

async fn attribute_clothes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
    multipart: Multipart,
) -> ApiResult<Json<AttributeAnalysisResponse>> {
    let user_id = query
        .user_id
        .ok_or_else(|| ApiError::BadRequest("User ID is required".to_string()))?;
    let files = collect_uploads(multipart).await?;
    let response = state.attribution.process_batch(files, &user_id).await?;
    Ok(Json(response))
}

async fn styler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StylerQuery>,
) -> ApiResult<Json<StylerResponse>> {
    let user_id = query
        .user_id
        .ok_or_else(|| ApiError::BadRequest("User ID is required".to_string()))?;
    let params = validate_styling_parameters(query.city, query.weather, query.occasion)?;
    let response = state.styling.recommend(&user_id, params).await?;
    Ok(Json(response))
}

async fn collect_uploads(mut multipart: Multipart) -> ApiResult<Vec<UploadedImage>> {
    let mut files = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let Some(file_name) = field.file_name().map(|value| value.to_string()) else {
                    continue;
                };
                let content_type = field
                    .content_type()
                    .map(|value| value.to_string())
                    .unwrap_or_default();
                match field.bytes().await {
                    Ok(bytes) => files.push(UploadedImage {
                        filename: file_name,
                        content_type,
                        bytes: bytes.to_vec(),
                    }),
                    Err(err) => {
                        return Err(ApiError::BadRequest(format!(
                            "failed to read uploaded file: {err}"
                        )));
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                return Err(ApiError::BadRequest(format!(
                    "failed to read multipart form: {err}"
                )));
            }
        }
    }
    Ok(files)
}
