//! DICOM传输语法支持模块
//!
//! 传输语法描述统一来自 dicom-rs 的注册表，这里只补充归档关心的判定。

use dicom_encoding::{Codec, TransferSyntax, TransferSyntaxIndex};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use pacs_core::{PacsError, Result};
use tracing::warn;

static REGISTRY: TransferSyntaxRegistry = TransferSyntaxRegistry;

/// DICOM传输语法管理器
#[derive(Debug, Default)]
pub struct TransferSyntaxManager;

fn normalize(uid: &str) -> &str {
    uid.trim_matches(|c: char| c.is_whitespace() || c == '\0')
}

impl TransferSyntaxManager {
    pub fn new() -> Self {
        Self
    }

    /// 查找可按偏移寻址的传输语法
    ///
    /// 数据集经过 Deflate 压缩时元素偏移没有意义，返回数据损坏；
    /// 注册表中没有的UID按显式VR小端处理。
    pub fn lookup(&self, uid: &str) -> Result<&'static TransferSyntax> {
        let uid = normalize(uid);
        match REGISTRY.get(uid) {
            Some(ts) if matches!(ts.codec(), Codec::Dataset(_)) => Err(PacsError::data_corrupt(
                format!("传输语法 {} 的数据集经过压缩，不支持像素偏移定位", ts.name()),
            )),
            Some(ts) => Ok(ts),
            None => {
                warn!("未知的传输语法 {}, 按显式VR小端处理", uid);
                REGISTRY
                    .get(transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .ok_or_else(|| PacsError::Internal("传输语法注册表缺少显式VR小端".to_string()))
            }
        }
    }

    /// 像素数据是否以封装（压缩）片段形式存放
    pub fn is_encapsulated(&self, uid: &str) -> bool {
        REGISTRY
            .get(normalize(uid))
            .map(|ts| ts.is_encapsulated_pixel_data())
            .unwrap_or(false)
    }

    pub fn is_supported(&self, uid: &str) -> bool {
        self.lookup(uid).is_ok()
    }
}

/// 常用的传输语法UID常量
pub mod transfer_syntax_uids {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_encoding::Endianness;

    #[test]
    fn test_lookup() {
        let manager = TransferSyntaxManager::new();
        let implicit = manager
            .lookup(transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .unwrap();
        assert_eq!(implicit.uid(), transfer_syntax_uids::IMPLICIT_VR_LITTLE_ENDIAN);

        let big = manager.lookup("1.2.840.10008.1.2.2\0").unwrap();
        assert_eq!(big.endianness(), Endianness::Big);

        let unknown = manager.lookup("1.2.3.999").unwrap();
        assert_eq!(unknown.uid(), transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN);

        assert!(matches!(
            manager.lookup(transfer_syntax_uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN),
            Err(PacsError::DataCorrupt(_))
        ));
    }

    #[test]
    fn test_encapsulation() {
        let manager = TransferSyntaxManager::new();
        assert!(manager.is_encapsulated(transfer_syntax_uids::JPEG_2000));
        assert!(manager.is_encapsulated(transfer_syntax_uids::RLE_LOSSLESS));
        assert!(manager.is_encapsulated(transfer_syntax_uids::JPEG_BASELINE));
        assert!(!manager.is_encapsulated(transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN));
        assert!(manager.is_supported("1.2.840.10008.1.2.4.70"));
        assert!(!manager.is_supported(transfer_syntax_uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN));
    }
}
