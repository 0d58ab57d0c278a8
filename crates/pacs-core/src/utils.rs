//! 通用工具函数

use chrono::Utc;
use uuid::Uuid;

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    let id = Uuid::new_v4().as_u128() % 10u128.pow(20);
    format!("{}.{}.{}", "1.2.826.0.1.3680043.9.7382", Utc::now().timestamp(), id)
}

/// 验证DICOM UID格式: 最长64字符，点分数字，组件不能为空且不能有前导零
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|part| {
        !part.is_empty()
            && part.chars().all(|c| c.is_ascii_digit())
            && (part == "0" || !part.starts_with('0'))
    })
}

/// 暂存区内唯一的文件名
pub fn unique_file_name(prefix: &str, extension: &str) -> String {
    format!("{}-{}.{}", prefix, Uuid::new_v4().simple(), extension)
}
