//! HTTP处理器

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use pacs_core::{ErrorBody, ErrorKind, FetchInformation, FetchRequest, PacsError};
use pacs_storage::{FetchService, StorageDevice};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub device: Arc<StorageDevice>,
    pub fetch: Arc<dyn FetchService>,
}

/// 以 `{kind, message}` 返回的错误
#[derive(Debug)]
pub struct ApiError(pub PacsError);

impl From<PacsError> for ApiError {
    fn from(err: PacsError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::DataCorrupt | ErrorKind::TruncatedSource => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ConstraintViolation | ErrorKind::InvalidSessionState => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// 健康检查处理器
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "device": state.device.name(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// FetchAsStream
pub async fn fetch_as_stream(
    State(state): State<AppState>,
    Json(request): Json<FetchRequest>,
) -> Result<Json<Vec<FetchInformation>>, ApiError> {
    info!(
        "Fetch request for {} identifiers ({:?})",
        request.identifiers.len(),
        request.loading_mode
    );
    let results = state.fetch.fetch(&request).await?;
    Ok(Json(results))
}
