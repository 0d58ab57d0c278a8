//! 有符号像素转换策略
//!
//! 这里只给出策略标记，不做像素解码。

use crate::transfer_syntax::TransferSyntaxManager;
use pacs_core::{tags, Attributes, ImageTranslationStatus, TranslationType};

/// 转换策略
#[derive(Debug, Clone, Copy)]
pub struct TranslationPolicy {
    /// 需要转换的影像采用的映射方式
    pub signed_mapping: TranslationType,
}

impl Default for TranslationPolicy {
    fn default() -> Self {
        Self {
            signed_mapping: TranslationType::Regular,
        }
    }
}

impl TranslationPolicy {
    pub fn new(signed_mapping: TranslationType) -> Self {
        Self { signed_mapping }
    }

    /// 封装像素无法按样本转换；有符号像素需要转换
    pub fn evaluate(&self, header: &Attributes) -> ImageTranslationStatus {
        let encapsulated = header
            .get_trimmed(tags::TRANSFER_SYNTAX_UID)
            .map(|uid| TransferSyntaxManager::new().is_encapsulated(uid))
            .unwrap_or(false);
        if encapsulated {
            return ImageTranslationStatus::NotSupported;
        }
        match header.get_trimmed(tags::PIXEL_REPRESENTATION) {
            Some("1") => ImageTranslationStatus::ShouldBeTranslated,
            _ => ImageTranslationStatus::ShouldNotBeTranslated,
        }
    }

    pub fn translation_type(&self, status: ImageTranslationStatus) -> TranslationType {
        match status {
            ImageTranslationStatus::ShouldBeTranslated => self.signed_mapping,
            _ => TranslationType::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_evaluation() {
        let policy = TranslationPolicy::default();
        let unsigned = Attributes::new().with(tags::PIXEL_REPRESENTATION, "0");
        assert_eq!(
            policy.evaluate(&unsigned),
            ImageTranslationStatus::ShouldNotBeTranslated
        );

        let signed = Attributes::new()
            .with(tags::PIXEL_REPRESENTATION, "1")
            .with(tags::TRANSFER_SYNTAX_UID, "1.2.840.10008.1.2.1");
        assert_eq!(
            policy.evaluate(&signed),
            ImageTranslationStatus::ShouldBeTranslated
        );
        assert_eq!(
            policy.translation_type(ImageTranslationStatus::ShouldBeTranslated),
            TranslationType::Regular
        );

        let jpeg = signed.with(tags::TRANSFER_SYNTAX_UID, "1.2.840.10008.1.2.4.50");
        assert_eq!(policy.evaluate(&jpeg), ImageTranslationStatus::NotSupported);
        assert_eq!(
            policy.translation_type(ImageTranslationStatus::NotSupported),
            TranslationType::None
        );
    }
}
