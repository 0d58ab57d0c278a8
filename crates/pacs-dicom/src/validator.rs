//! DICOM头部验证模块
//!
//! 提交前对每个待写入实体的属性做结构检查，错误在提交时转为约束冲突。

use crate::transfer_syntax::TransferSyntaxManager;
use pacs_core::utils::is_valid_dicom_uid;
use pacs_core::{tags, Attributes, DicomTag, Level, PacsError, Result};
use tracing::{debug, warn};

/// DICOM头部验证器
#[derive(Debug, Default)]
pub struct DicomValidator {
    transfer_syntax_manager: TransferSyntaxManager,
}

impl DicomValidator {
    pub fn new() -> Self {
        Self {
            transfer_syntax_manager: TransferSyntaxManager::new(),
        }
    }

    /// 按层级验证头部属性
    pub fn validate_header(&self, level: Level, header: &Attributes) -> ValidationResult {
        let mut result = ValidationResult::new();

        self.validate_required_uids(level, header, &mut result);
        self.validate_dates(header, &mut result);
        self.validate_numbers(header, &mut result);
        if level == Level::Image {
            self.validate_transfer_syntax(header, &mut result);
        }

        if result.has_warnings() {
            warn!(
                "Header validation for {} level: {}",
                level,
                result.get_summary()
            );
        } else {
            debug!("{} 层级头部验证: {}", level, result.get_summary());
        }
        result
    }

    fn validate_required_uids(&self, level: Level, header: &Attributes, result: &mut ValidationResult) {
        let mut required: Vec<(&str, DicomTag)> = vec![("Study Instance UID", tags::STUDY_INSTANCE_UID)];
        if matches!(level, Level::Series | Level::Image | Level::Frame) {
            required.push(("Series Instance UID", tags::SERIES_INSTANCE_UID));
        }
        if matches!(level, Level::Image | Level::Frame) {
            required.push(("SOP Instance UID", tags::SOP_INSTANCE_UID));
            required.push(("SOP Class UID", tags::SOP_CLASS_UID));
        }

        for (name, tag) in required {
            match header.get_trimmed(tag) {
                Some(uid) if is_valid_dicom_uid(uid) => {}
                Some(uid) => result.add_error(format!("{} 格式无效: {}", name, uid)),
                None => result.add_error(format!("{} 缺失", name)),
            }
        }
    }

    fn validate_dates(&self, header: &Attributes, result: &mut ValidationResult) {
        if let Some(date) = header.get_trimmed(tags::STUDY_DATE) {
            if !is_valid_dicom_date(date) {
                result.add_warning(format!("检查日期格式无效: {}", date));
            }
        }
    }

    fn validate_numbers(&self, header: &Attributes, result: &mut ValidationResult) {
        for (name, tag) in [
            ("序列号", tags::SERIES_NUMBER),
            ("实例号", tags::INSTANCE_NUMBER),
        ] {
            if let Some(value) = header.get_trimmed(tag) {
                if value.parse::<i32>().is_err() {
                    result.add_warning(format!("{}格式无效: {}", name, value));
                }
            }
        }
        for (name, tag) in [
            ("帧数", tags::NUMBER_OF_FRAMES),
            ("行数", tags::ROWS),
            ("列数", tags::COLUMNS),
        ] {
            if let Some(value) = header.get_trimmed(tag) {
                if value.parse::<u32>().is_err() {
                    result.add_error(format!("{}格式无效: {}", name, value));
                }
            }
        }
    }

    fn validate_transfer_syntax(&self, header: &Attributes, result: &mut ValidationResult) {
        if let Some(uid) = header.get_trimmed(tags::TRANSFER_SYNTAX_UID) {
            if !self.transfer_syntax_manager.is_supported(uid) {
                result.add_error(format!("不支持的传输语法: {}", uid));
            }
        }
    }
}

/// 检查是否为有效的DICOM日期 (YYYYMMDD)
pub fn is_valid_dicom_date(date: &str) -> bool {
    if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let (Ok(year), Ok(month), Ok(day)) = (
        date[0..4].parse::<u32>(),
        date[4..6].parse::<u32>(),
        date[6..8].parse::<u32>(),
    ) else {
        return false;
    };
    if day == 0 {
        return false;
    }
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => day <= 31,
        4 | 6 | 9 | 11 => day <= 30,
        2 if (year % 400 == 0) || (year % 100 != 0 && year % 4 == 0) => day <= 29,
        2 => day <= 28,
        _ => false,
    }
}

/// 验证结果
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// 获取验证报告摘要
    pub fn get_summary(&self) -> String {
        if self.is_valid {
            if self.has_warnings() {
                format!("验证通过，但有 {} 个警告", self.warning_count())
            } else {
                "验证完全通过".to_string()
            }
        } else {
            format!(
                "验证失败：{} 个错误，{} 个警告",
                self.error_count(),
                self.warning_count()
            )
        }
    }

    /// 有错误时转为约束冲突
    pub fn into_result(self, subject: &str) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(PacsError::constraint(format!(
                "{} 头部验证失败: {}",
                subject,
                self.errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_header() -> Attributes {
        Attributes::new()
            .with(tags::STUDY_INSTANCE_UID, "1.2.3")
            .with(tags::SERIES_INSTANCE_UID, "1.2.3.4")
            .with(tags::SOP_INSTANCE_UID, "1.2.3.4.5")
            .with(tags::SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.2")
    }

    #[test]
    fn test_dicom_date_validation() {
        assert!(is_valid_dicom_date("20230101"));
        assert!(is_valid_dicom_date("20240229"));
        assert!(!is_valid_dicom_date("20230229"));
        assert!(!is_valid_dicom_date("20231301"));
        assert!(!is_valid_dicom_date("20230100"));
        assert!(!is_valid_dicom_date("2023011"));
    }

    #[test]
    fn test_image_header_requires_all_uids() {
        let validator = DicomValidator::new();
        assert!(validator.validate_header(Level::Image, &image_header()).is_valid);

        let mut header = image_header();
        header.remove(tags::SOP_CLASS_UID);
        let result = validator.validate_header(Level::Image, &header);
        assert_eq!(result.error_count(), 1);
        assert!(matches!(
            result.into_result("image"),
            Err(PacsError::ConstraintViolation(_))
        ));

        // 检查层级只需要检查UID
        assert!(validator.validate_header(Level::Study, &header).is_valid);
    }

    #[test]
    fn test_malformed_uid_and_numbers() {
        let validator = DicomValidator::new();
        let header = image_header()
            .with(tags::SERIES_INSTANCE_UID, "1.02.3")
            .with(tags::NUMBER_OF_FRAMES, "many")
            .with(tags::SERIES_NUMBER, "x");
        let result = validator.validate_header(Level::Image, &header);
        assert_eq!(result.error_count(), 2);
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();
        result.add_warning("测试警告".to_string());
        assert!(result.is_valid);
        result.add_error("测试错误".to_string());
        assert!(!result.is_valid);
        assert_eq!(result.get_summary(), "验证失败：1 个错误，1 个警告");
    }
}
