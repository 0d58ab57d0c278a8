//! 像素数据位置模型
//!
//! 描述像素数据“在哪里”：文件偏移、共享内存区域或远程引用。

use crate::error::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 像素数据的逻辑类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelDataType {
    FileOffsetLength,
    DicomFile,
    Wado,
    InMemory,
    Ahli,
}

/// 像素数据的物理来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelSource {
    File,
    WadoUri,
    Ahli,
}

/// 共享内存区域中的像素描述
///
/// 仅在所属会话提交或区域释放之前有效。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryPixelInformation {
    pub mmf_name: String,
    pub pixel_offset: u64,
    pub pixel_length: u64,
}

impl InMemoryPixelInformation {
    pub fn new(mmf_name: impl Into<String>, pixel_offset: u64, pixel_length: u64) -> Self {
        Self {
            mmf_name: mmf_name.into(),
            pixel_offset,
            pixel_length,
        }
    }

    /// 校验描述没有超出区域总大小
    pub fn check_within(&self, region_size: u64) -> Result<()> {
        match self.pixel_offset.checked_add(self.pixel_length) {
            Some(end) if end <= region_size => Ok(()),
            _ => Err(PacsError::data_corrupt(format!(
                "内存区域 {} 越界: offset={} length={} size={}",
                self.mmf_name, self.pixel_offset, self.pixel_length, region_size
            ))),
        }
    }
}

/// 指向复合文件内部像素数据的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDataReference {
    pub composite_file_name: PathBuf,
    pub pixel_offset: u64,
    pub pixel_length: u64,
}

/// 需要先下载到本地才能确定偏移与长度的远程像素引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteReference {
    Wado { uri: String },
    Ahli { reference: String },
}

impl RemoteReference {
    pub fn source(&self) -> PixelSource {
        match self {
            RemoteReference::Wado { .. } => PixelSource::WadoUri,
            RemoteReference::Ahli { .. } => PixelSource::Ahli,
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            RemoteReference::Wado { uri } => uri,
            RemoteReference::Ahli { reference } => reference,
        }
    }
}

/// 像素数据的物理位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum PixelLocation {
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
        /// 像素仍嵌在原复合文件中
        embedded: bool,
    },
    InMemory(InMemoryPixelInformation),
    Remote(RemoteReference),
}

impl PixelLocation {
    pub fn data_type(&self) -> PixelDataType {
        match self {
            PixelLocation::File { embedded: true, .. } => PixelDataType::DicomFile,
            PixelLocation::File { embedded: false, .. } => PixelDataType::FileOffsetLength,
            PixelLocation::InMemory(_) => PixelDataType::InMemory,
            PixelLocation::Remote(RemoteReference::Wado { .. }) => PixelDataType::Wado,
            PixelLocation::Remote(RemoteReference::Ahli { .. }) => PixelDataType::Ahli,
        }
    }

    pub fn source(&self) -> PixelSource {
        match self {
            PixelLocation::File { .. } | PixelLocation::InMemory(_) => PixelSource::File,
            PixelLocation::Remote(r) => r.source(),
        }
    }

    /// 已知长度，远程引用在下载前没有长度
    pub fn length(&self) -> Option<u64> {
        match self {
            PixelLocation::File { length, .. } => Some(*length),
            PixelLocation::InMemory(info) => Some(info.pixel_length),
            PixelLocation::Remote(_) => None,
        }
    }
}

impl From<BulkDataReference> for PixelLocation {
    fn from(r: BulkDataReference) -> Self {
        PixelLocation::File {
            path: r.composite_file_name,
            offset: r.pixel_offset,
            length: r.pixel_length,
            embedded: true,
        }
    }
}

/// 有符号像素映射为无符号的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranslationType {
    Regular,
    Truncated,
    None,
}

/// 影像在提供服务前是否需要转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageTranslationStatus {
    ShouldNotBeTranslated,
    ShouldBeTranslated,
    NotSupported,
}

impl ImageTranslationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageTranslationStatus::ShouldNotBeTranslated => "SHOULD_NOT_BE_TRANSLATED",
            ImageTranslationStatus::ShouldBeTranslated => "SHOULD_BE_TRANSLATED",
            ImageTranslationStatus::NotSupported => "NOT_SUPPORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SHOULD_NOT_BE_TRANSLATED" => Some(ImageTranslationStatus::ShouldNotBeTranslated),
            "SHOULD_BE_TRANSLATED" => Some(ImageTranslationStatus::ShouldBeTranslated),
            "NOT_SUPPORTED" => Some(ImageTranslationStatus::NotSupported),
            _ => None,
        }
    }
}
