//! DICOM头部写入
//!
//! 把属性包写成显式VR小端的 Part 10 文件，可选附带像素数据。

use crate::parser::is_binary_vr;
use crate::transfer_syntax::transfer_syntax_uids;
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::value::C;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use pacs_core::utils::generate_dicom_uid;
use pacs_core::{tags, Attributes, DicomTag, PacsError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 缺少 SOP Class UID 时使用的二次采集类
const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

fn vr_of(tag: Tag) -> VR {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.vr().relaxed())
        .unwrap_or(VR::LO)
}

fn numbers<T: std::str::FromStr>(tag: DicomTag, vr: VR, value: &str) -> Result<C<T>> {
    value
        .split('\\')
        .map(|p| p.trim().parse::<T>())
        .collect::<std::result::Result<C<T>, _>>()
        .map_err(|_| PacsError::Validation(format!("{} 的值 {:?} 不符合 {:?}", tag, value, vr)))
}

fn primitive_value(tag: DicomTag, vr: VR, value: &str) -> Result<PrimitiveValue> {
    Ok(match vr {
        VR::US => PrimitiveValue::U16(numbers(tag, vr, value)?),
        VR::SS => PrimitiveValue::I16(numbers(tag, vr, value)?),
        VR::UL => PrimitiveValue::U32(numbers(tag, vr, value)?),
        VR::SL => PrimitiveValue::I32(numbers(tag, vr, value)?),
        VR::FL => PrimitiveValue::F32(numbers(tag, vr, value)?),
        VR::FD => PrimitiveValue::F64(numbers(tag, vr, value)?),
        _ if value.contains('\\') => {
            PrimitiveValue::Strs(value.split('\\').map(str::to_string).collect())
        }
        _ => PrimitiveValue::from(value.to_string()),
    })
}

/// 写出复合对象文件
///
/// 文件元信息组与像素数据由本函数生成，属性包中的同名标签被忽略。
pub fn write_composite(path: &Path, attributes: &Attributes, pixel_data: Option<&[u8]>) -> Result<()> {
    let mut obj = InMemDicomObject::new_empty();
    for (tag, value) in attributes.iter() {
        if tag.group() == 0x0002 || tag == tags::PIXEL_DATA {
            continue;
        }
        let dicom_tag = Tag(tag.group(), tag.element());
        let vr = vr_of(dicom_tag);
        if is_binary_vr(vr) {
            debug!("跳过二进制标签 {}", tag);
            continue;
        }
        obj.put(DataElement::new(dicom_tag, vr, primitive_value(tag, vr, value)?));
    }
    if let Some(pixels) = pixel_data {
        obj.put(DataElement::new(
            Tag(tags::PIXEL_DATA.group(), tags::PIXEL_DATA.element()),
            VR::OB,
            PrimitiveValue::from(pixels.to_vec()),
        ));
    }

    let sop_class = attributes
        .get_trimmed(tags::SOP_CLASS_UID)
        .unwrap_or(SECONDARY_CAPTURE)
        .to_string();
    let sop_instance = attributes
        .get_trimmed(tags::SOP_INSTANCE_UID)
        .map(str::to_string)
        .unwrap_or_else(generate_dicom_uid);
    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class)
                .media_storage_sop_instance_uid(sop_instance),
        )
        .map_err(|e| PacsError::Storage(format!("无法构建文件元信息: {}", e)))?;
    file_obj
        .write_to_file(path)
        .map_err(|e| PacsError::Storage(format!("无法写入DICOM文件 {:?}: {}", path, e)))?;
    Ok(())
}

/// 异步写出只含头部的文件，返回文件大小
pub async fn write_header(path: PathBuf, attributes: Attributes) -> Result<u64> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_composite(&target, &attributes, None))
        .await
        .map_err(|e| PacsError::Internal(format!("写入任务失败: {}", e)))??;
    Ok(tokio::fs::metadata(&path).await?.len())
}
