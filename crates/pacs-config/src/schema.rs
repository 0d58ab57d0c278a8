//! 属性目录
//!
//! 按层级保存四类标签列表（快速访问、可查询、索引查询、修改时跳过）
//! 以及DICOMDIR标签、支持的SOP类和两组字符串配置。加载完成后只读。

use pacs_core::{DicomTag, Level, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::reader::SchemaReader;

/// 目录中的一个字典标签
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DictionaryTag {
    pub tag: DicomTag,
    /// 配置中使用的名称（关键字或标签文本）
    pub keyword: String,
}

impl DictionaryTag {
    pub fn new(tag: DicomTag, keyword: impl Into<String>) -> Self {
        Self {
            tag,
            keyword: keyword.into(),
        }
    }
}

type TagLists = HashMap<Level, Vec<DictionaryTag>>;

/// 数据库属性目录
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fast_access: TagLists,
    queryable: TagLists,
    index_queryable: TagLists,
    skip_modify: TagLists,
    dicom_dir: TagLists,
    sop_class_uids: Vec<String>,
    sids_attributes: HashMap<String, String>,
    database_service: HashMap<String, String>,
    cleanup: HashMap<String, String>,
}

fn append(lists: &mut TagLists, level: Level, tags: impl IntoIterator<Item = DictionaryTag>) {
    lists.entry(level).or_default().extend(tags);
}

fn list(lists: &TagLists, level: Level) -> &[DictionaryTag] {
    lists.get(&level).map(Vec::as_slice).unwrap_or(&[])
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从读取器加载目录
    pub fn load(reader: &dyn SchemaReader) -> Result<Self> {
        reader.read()
    }

    // 追加操作只做拼接，去重由调用方负责

    pub fn add_fast_access(&mut self, level: Level, tags: impl IntoIterator<Item = DictionaryTag>) {
        append(&mut self.fast_access, level, tags);
    }

    pub fn add_queryable(&mut self, level: Level, tags: impl IntoIterator<Item = DictionaryTag>) {
        append(&mut self.queryable, level, tags);
    }

    pub fn add_index_queryable(
        &mut self,
        level: Level,
        tags: impl IntoIterator<Item = DictionaryTag>,
    ) {
        append(&mut self.index_queryable, level, tags);
    }

    pub fn add_skip_modify(&mut self, level: Level, tags: impl IntoIterator<Item = DictionaryTag>) {
        append(&mut self.skip_modify, level, tags);
    }

    pub fn add_dicom_dir(&mut self, level: Level, tags: impl IntoIterator<Item = DictionaryTag>) {
        append(&mut self.dicom_dir, level, tags);
    }

    pub fn add_sop_class_uid(&mut self, uid: impl Into<String>) {
        self.sop_class_uids.push(uid.into());
    }

    pub fn set_sids_attributes(&mut self, values: HashMap<String, String>) {
        self.sids_attributes = values;
    }

    pub fn set_database_service_config(&mut self, values: HashMap<String, String>) {
        self.database_service = values;
    }

    pub fn set_cleanup_config(&mut self, values: HashMap<String, String>) {
        self.cleanup = values;
    }

    pub fn get_fast_access_tags(&self, level: Level) -> &[DictionaryTag] {
        list(&self.fast_access, level)
    }

    pub fn get_queryable_tags(&self, level: Level) -> &[DictionaryTag] {
        list(&self.queryable, level)
    }

    pub fn get_index_queryable(&self, level: Level) -> &[DictionaryTag] {
        list(&self.index_queryable, level)
    }

    pub fn get_tags_to_skip_modification(&self, level: Level) -> &[DictionaryTag] {
        list(&self.skip_modify, level)
    }

    pub fn get_dicom_dir_tags(&self, level: Level) -> &[DictionaryTag] {
        list(&self.dicom_dir, level)
    }

    pub fn get_sop_class_uids(&self) -> &[String] {
        &self.sop_class_uids
    }

    pub fn is_sop_class_supported(&self, uid: &str) -> bool {
        self.sop_class_uids.is_empty() || self.sop_class_uids.iter().any(|u| u == uid)
    }

    pub fn get_sids_attributes(&self) -> &HashMap<String, String> {
        &self.sids_attributes
    }

    pub fn get_database_service_config(&self) -> &HashMap<String, String> {
        &self.database_service
    }

    pub fn get_cleanup_config(&self) -> &HashMap<String, String> {
        &self.cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::tags;

    fn tag(t: DicomTag, name: &str) -> DictionaryTag {
        DictionaryTag::new(t, name)
    }

    #[test]
    fn test_add_fast_access_concatenates() {
        let mut schema = Schema::new();
        let a = vec![tag(tags::PATIENT_ID, "PatientID"), tag(tags::STUDY_DATE, "StudyDate")];
        let b = vec![tag(tags::PATIENT_ID, "PatientID"), tag(tags::MODALITY, "Modality")];
        schema.add_fast_access(Level::Study, a.clone());
        schema.add_fast_access(Level::Study, b.clone());

        let expected: Vec<DictionaryTag> = a.into_iter().chain(b).collect();
        assert_eq!(schema.get_fast_access_tags(Level::Study), expected.as_slice());
    }

    #[test]
    fn test_absent_level_reads_as_empty() {
        let schema = Schema::new();
        assert!(schema.get_queryable_tags(Level::Frame).is_empty());
        assert!(schema.get_tags_to_skip_modification(Level::Image).is_empty());
        assert!(schema.get_dicom_dir_tags(Level::Patient).is_empty());
        assert!(schema.get_cleanup_config().is_empty());
    }

    #[test]
    fn test_sop_class_support() {
        let mut schema = Schema::new();
        assert!(schema.is_sop_class_supported("1.2.3"));
        schema.add_sop_class_uid("1.2.840.10008.5.1.4.1.1.2");
        assert!(schema.is_sop_class_supported("1.2.840.10008.5.1.4.1.1.2"));
        assert!(!schema.is_sop_class_supported("1.2.3"));
    }
}
