//! 按帧检索
//!
//! 帧序号按 DICOMweb 约定从 1 开始，只解析被请求的那一帧。

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use pacs_core::{EntityType, Identifier, LoadingMode, PacsError, PixelHandle};
use serde::Deserialize;
use tracing::info;

use crate::handlers::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct FramePath {
    pub study: String,
    pub series: String,
    pub instance: String,
    pub frame: u32,
}

/// 返回单帧原始像素
pub async fn retrieve_frame(
    State(state): State<AppState>,
    Path(path): Path<FramePath>,
) -> Result<Response, ApiError> {
    info!("WADO frame retrieve: {:?}", path);
    if path.frame == 0 {
        return Err(PacsError::Validation("帧序号从 1 开始".to_string()).into());
    }
    let image = Identifier::image(path.study, path.series, path.instance);
    let frame = image.frame(path.frame - 1)?;

    let results = match state
        .fetch
        .fetch_as_stream(&[frame], LoadingMode::Eager, false)
        .await
    {
        Ok(results) => results,
        // 单帧影像没有帧记录，第 1 帧就是影像本身的像素
        Err(PacsError::NotFound(_)) if path.frame == 1 => state
            .fetch
            .fetch_as_stream(&[image.clone()], LoadingMode::Eager, false)
            .await?
            .into_iter()
            .filter(|info| {
                info.images
                    .iter()
                    .all(|i| i.entity_type != EntityType::MFImage)
            })
            .collect(),
        Err(e) => return Err(e.into()),
    };
    let span = results
        .first()
        .and_then(|info| info.images.first())
        .and_then(|image| image.pixels.first())
        .and_then(PixelHandle::as_local)
        .ok_or_else(|| PacsError::NotFound(format!("{} 没有第 {} 帧", image, path.frame)))?;

    let bytes = span.read_all().await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}
