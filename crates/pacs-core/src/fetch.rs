//! 像素获取结果类型

use crate::error::{PacsError, Result};
use crate::models::{EntityType, Identifier};
use crate::pixel::{ImageTranslationStatus, RemoteReference};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 远程数据的加载策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingMode {
    /// 返回前把远程像素全部下载到暂存区
    #[default]
    Eager,
    /// 远程像素只返回引用，由调用方决定何时下载
    Lazy,
}

/// FetchAsStream 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub loading_mode: LoadingMode,
    #[serde(default)]
    pub skip_loading_frames: bool,
}

/// 本地文件中的一段字节
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSpan {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl PixelSpan {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    /// 校验文件存在且范围没有越过文件末尾
    pub async fn check(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            PacsError::data_corrupt(format!("无法访问像素文件 {:?}: {}", self.path, e))
        })?;
        let end = self.offset.checked_add(self.length).ok_or_else(|| {
            PacsError::data_corrupt(format!("像素范围溢出: {:?}", self.path))
        })?;
        if end > meta.len() {
            return Err(PacsError::data_corrupt(format!(
                "像素范围越过文件末尾: {:?} offset={} length={} file_size={}",
                self.path,
                self.offset,
                self.length,
                meta.len()
            )));
        }
        Ok(())
    }

    /// 打开一个只覆盖该范围的读取流
    pub async fn open(&self) -> Result<tokio::io::Take<tokio::fs::File>> {
        self.check().await?;
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        Ok(file.take(self.length))
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.open().await?;
        let mut buf = Vec::with_capacity(self.length as usize);
        reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != self.length {
            return Err(PacsError::data_corrupt(format!(
                "读取 {:?} 时数据不足: 期望 {} 字节, 实际 {} 字节",
                self.path,
                self.length,
                buf.len()
            )));
        }
        Ok(buf)
    }
}

/// 可读取的像素句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "handle", rename_all = "snake_case")]
pub enum PixelHandle {
    Local(PixelSpan),
    /// 延迟加载模式下尚未下载的远程像素
    Deferred(RemoteReference),
}

impl PixelHandle {
    pub fn as_local(&self) -> Option<&PixelSpan> {
        match self {
            PixelHandle::Local(span) => Some(span),
            PixelHandle::Deferred(_) => None,
        }
    }
}

/// 单个影像的获取信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFetchInformation {
    pub identifier: Identifier,
    pub entity_type: EntityType,
    pub header: PixelSpan,
    /// 单帧影像一个元素，多帧影像按帧序排列
    pub pixels: Vec<PixelHandle>,
    pub translation_status: Option<ImageTranslationStatus>,
}

/// 每个序列一条获取信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchInformation {
    pub series: Identifier,
    pub images: Vec<ImageFetchInformation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_span_reads_exact_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"headerPIXELStrailer").unwrap();
        let span = PixelSpan::new(file.path(), 6, 6);
        assert_eq!(span.read_all().await.unwrap(), b"PIXELS");
    }

    #[tokio::test]
    async fn test_span_past_end_is_data_corrupt() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"short").unwrap();
        let span = PixelSpan::new(file.path(), 2, 10);
        let err = span.read_all().await.unwrap_err();
        assert!(matches!(err, PacsError::DataCorrupt(_)));
    }

    #[tokio::test]
    async fn test_span_missing_file_is_data_corrupt() {
        let span = PixelSpan::new("/nonexistent/pixels.bin", 0, 1);
        assert!(matches!(span.check().await, Err(PacsError::DataCorrupt(_))));
    }
}
