//! DICOM复合对象解析器
//!
//! 读取头部属性并定位像素数据，两者都在像素数据元素处停止，不读取像素内容。

use crate::locator::{locate_pixel_data, PixelDataElement};
use dicom::core::header::Header;
use dicom::core::VR;
use dicom::dictionary_std::tags as dicom_tags;
use dicom::object::OpenFileOptions;
use pacs_core::{tags, Attributes, DicomTag, PacsError, PixelLocation, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// 解析后的复合对象
#[derive(Debug, Clone)]
pub struct CompositeObject {
    pub path: PathBuf,
    pub attributes: Attributes,
    pub transfer_syntax_uid: String,
    pub pixel: Option<PixelDataElement>,
    pub file_size: u64,
}

impl CompositeObject {
    /// 像素仍嵌在该文件中的位置
    pub fn pixel_location(&self) -> Option<PixelLocation> {
        self.pixel.map(|p| PixelLocation::File {
            path: self.path.clone(),
            offset: p.offset,
            length: p.length,
            embedded: true,
        })
    }
}

/// DICOM数据解析器
#[derive(Debug, Default)]
pub struct DicomParser;

impl DicomParser {
    pub fn new() -> Self {
        Self
    }

    /// 解析复合对象文件
    pub async fn parse_composite(path: impl AsRef<Path>) -> Result<CompositeObject> {
        let path = path.as_ref().to_path_buf();
        info!("开始解析DICOM文件: {:?}", path);

        let source = path.clone();
        let (located, mut attributes) = tokio::task::spawn_blocking(move || {
            let located = locate_pixel_data(&source)?;
            let attributes = read_attributes(&source)?;
            Ok::<_, PacsError>((located, attributes))
        })
        .await
        .map_err(|e| PacsError::Internal(format!("解析任务失败: {}", e)))??;
        attributes.set(tags::TRANSFER_SYNTAX_UID, located.transfer_syntax_uid.clone());

        debug!(
            "Parsed {:?}: {} attributes, pixel data {:?}",
            path,
            attributes.len(),
            located.pixel
        );
        Ok(CompositeObject {
            path,
            attributes,
            transfer_syntax_uid: located.transfer_syntax_uid,
            pixel: located.pixel,
            file_size: located.file_size,
        })
    }
}

/// 不携带文本值的VR
pub(crate) fn is_binary_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::SQ | VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::UN
    )
}

/// 读取像素数据之前的全部文本属性
fn read_attributes(path: &Path) -> Result<Attributes> {
    let obj = OpenFileOptions::new()
        .read_until(dicom_tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| {
            error!("DICOM文件解析失败: {:?}, {}", path, e);
            PacsError::DicomParseError(format!("无法解析DICOM文件 {:?}: {}", path, e))
        })?;

    let mut attributes = Attributes::new();
    for elem in obj.iter() {
        if is_binary_vr(elem.vr()) {
            continue;
        }
        let tag = elem.tag();
        match elem.to_str() {
            Ok(value) => attributes.set(
                DicomTag::new(tag.group(), tag.element()),
                value.trim_end_matches(['\0', ' ']).to_string(),
            ),
            Err(e) => debug!("标签 {} 无法转换为文本: {}", tag, e),
        }
    }
    Ok(attributes)
}
