//! 进程级属性目录
//!
//! 启动时显式初始化一次，之后以 `Arc` 共享给所有使用者。

use pacs_core::{DicomTag, Level, PacsError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

use crate::provider::StudySeriesAttributeProvider;
use crate::reader::SchemaReader;
use crate::schema::Schema;

static GLOBAL_CATALOG: OnceLock<Arc<AttributeCatalog>> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// 目录与其派生的检查/序列属性集合
#[derive(Debug)]
pub struct AttributeCatalog {
    schema: Schema,
    study_series: StudySeriesAttributeProvider,
}

impl AttributeCatalog {
    pub fn new(schema: Schema) -> Self {
        let study_series = StudySeriesAttributeProvider::with_schema(&schema);
        Self {
            schema,
            study_series,
        }
    }

    pub fn load(reader: &dyn SchemaReader) -> Result<Self> {
        Ok(Self::new(Schema::load(reader)?))
    }

    /// 初始化进程级目录
    ///
    /// 并发的首次调用者会阻塞到初始化完成；加载失败时保持未初始化状态。
    pub fn initialize(reader: &dyn SchemaReader) -> Result<Arc<AttributeCatalog>> {
        if let Some(catalog) = GLOBAL_CATALOG.get() {
            return Ok(catalog.clone());
        }
        let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(catalog) = GLOBAL_CATALOG.get() {
            return Ok(catalog.clone());
        }
        let catalog = Arc::new(Self::load(reader)?);
        let _ = GLOBAL_CATALOG.set(catalog.clone());
        info!("Global attribute catalog initialized");
        Ok(catalog)
    }

    pub fn global() -> Result<Arc<AttributeCatalog>> {
        GLOBAL_CATALOG
            .get()
            .cloned()
            .ok_or_else(|| PacsError::configuration("属性目录尚未初始化"))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn study_series(&self) -> &StudySeriesAttributeProvider {
        &self.study_series
    }

    /// 某层级需要缓存到索引记录中的标签
    pub fn fast_access_tags(&self, level: Level) -> Vec<DicomTag> {
        match level {
            Level::Study => self.study_series.study_attributes().iter().map(|t| t.tag).collect(),
            Level::Series => self.study_series.series_attributes().iter().map(|t| t.tag).collect(),
            _ => self
                .schema
                .get_fast_access_tags(level)
                .iter()
                .map(|t| t.tag)
                .collect(),
        }
    }

    /// 某层级需要写入查询索引的标签（可查询与索引查询合并去重）
    pub fn indexed_tags(&self, level: Level) -> Vec<DicomTag> {
        let mut seen = HashSet::new();
        self.schema
            .get_queryable_tags(level)
            .iter()
            .chain(self.schema.get_index_queryable(level))
            .map(|t| t.tag)
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn is_skip_modify(&self, level: Level, tag: DicomTag) -> bool {
        self.schema
            .get_tags_to_skip_modification(level)
            .iter()
            .any(|t| t.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ConfigSchemaReader;
    use pacs_core::tags;
    use std::thread;

    const SAMPLE: &str = r#"
[levels.study]
fast_access = ["PatientID", "StudyDate"]
queryable = ["PatientID"]
index_queryable = ["PatientID", "AccessionNumber"]

[levels.series]
fast_access = ["PatientID", "Modality"]

[levels.image]
skip_modify = ["SOPInstanceUID"]
"#;

    #[test]
    fn test_catalog_tag_views() {
        let catalog = AttributeCatalog::load(&ConfigSchemaReader::from_toml_str(SAMPLE)).unwrap();
        assert_eq!(catalog.fast_access_tags(Level::Series), vec![tags::MODALITY]);
        assert_eq!(
            catalog.indexed_tags(Level::Study),
            vec![tags::PATIENT_ID, tags::ACCESSION_NUMBER]
        );
        assert!(catalog.is_skip_modify(Level::Image, tags::SOP_INSTANCE_UID));
        assert!(!catalog.is_skip_modify(Level::Study, tags::SOP_INSTANCE_UID));
    }

    #[test]
    fn test_global_initializes_once_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    AttributeCatalog::initialize(&ConfigSchemaReader::from_toml_str(SAMPLE))
                        .unwrap()
                })
            })
            .collect();
        let catalogs: Vec<Arc<AttributeCatalog>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for c in &catalogs {
            assert!(Arc::ptr_eq(c, &catalogs[0]));
        }
        assert!(Arc::ptr_eq(&AttributeCatalog::global().unwrap(), &catalogs[0]));
    }
}
