//! 属性目录读取器

use config::{Config, File, FileFormat};
use dicom_core::dictionary::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use pacs_core::{DicomTag, Level, PacsError, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::schema::{DictionaryTag, Schema};

/// 默认的目录资源名
pub const DEFAULT_SCHEMA_RESOURCE: &str = "PatientDatabaseSchema";

/// 目录读取接口
pub trait SchemaReader: Send + Sync {
    fn read(&self) -> Result<Schema>;
}

#[derive(Debug, Default, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    sop_class_uids: Vec<String>,
    #[serde(default)]
    levels: HashMap<Level, LevelDocument>,
    #[serde(default)]
    sids_attributes: HashMap<String, String>,
    #[serde(default)]
    database_service: HashMap<String, String>,
    #[serde(default)]
    cleanup: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct LevelDocument {
    #[serde(default)]
    fast_access: Vec<String>,
    #[serde(default)]
    queryable: Vec<String>,
    #[serde(default)]
    index_queryable: Vec<String>,
    #[serde(default)]
    skip_modify: Vec<String>,
    #[serde(default)]
    dicomdir: Vec<String>,
}

#[derive(Debug, Clone)]
enum SchemaSource {
    Path(String),
    Inline(String),
}

/// 基于 `config` 的目录读取器，支持 TOML/JSON/YAML 等格式
#[derive(Debug, Clone)]
pub struct ConfigSchemaReader {
    source: SchemaSource,
}

impl ConfigSchemaReader {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            source: SchemaSource::Path(path.into()),
        }
    }

    /// 直接从 TOML 文本读取
    pub fn from_toml_str(content: impl Into<String>) -> Self {
        Self {
            source: SchemaSource::Inline(content.into()),
        }
    }

    fn document(&self) -> Result<SchemaDocument> {
        let builder = match &self.source {
            SchemaSource::Path(path) => Config::builder().add_source(File::with_name(path)),
            SchemaSource::Inline(content) => {
                Config::builder().add_source(File::from_str(content, FileFormat::Toml))
            }
        };
        builder
            .build()
            .and_then(|c| c.try_deserialize::<SchemaDocument>())
            .map_err(|e| PacsError::configuration(format!("无法加载属性目录: {}", e)))
    }
}

impl Default for ConfigSchemaReader {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA_RESOURCE)
    }
}

impl SchemaReader for ConfigSchemaReader {
    fn read(&self) -> Result<Schema> {
        let document = self.document()?;
        let mut schema = Schema::new();

        for (level, doc) in &document.levels {
            schema.add_fast_access(*level, resolve_tags(&doc.fast_access)?);
            schema.add_queryable(*level, resolve_tags(&doc.queryable)?);
            schema.add_index_queryable(*level, resolve_tags(&doc.index_queryable)?);
            schema.add_skip_modify(*level, resolve_tags(&doc.skip_modify)?);
            schema.add_dicom_dir(*level, resolve_tags(&doc.dicomdir)?);
            debug!(
                "Loaded schema level {}: {} fast-access, {} queryable",
                level,
                doc.fast_access.len(),
                doc.queryable.len()
            );
        }

        for uid in document.sop_class_uids {
            schema.add_sop_class_uid(uid);
        }
        schema.set_sids_attributes(document.sids_attributes);
        schema.set_database_service_config(document.database_service);
        schema.set_cleanup_config(document.cleanup);

        info!(
            "Attribute catalog loaded: {} levels, {} SOP classes",
            document.levels.len(),
            schema.get_sop_class_uids().len()
        );
        Ok(schema)
    }
}

/// 解析单个标签名：先按 `(gggg,eeee)` 解析，再按标准字典关键字查找
pub fn resolve_tag(name: &str) -> Result<DictionaryTag> {
    if let Ok(tag) = name.parse::<DicomTag>() {
        return Ok(DictionaryTag::new(tag, name.trim()));
    }
    let tag = StandardDataDictionary
        .parse_tag(name.trim())
        .ok_or_else(|| PacsError::configuration(format!("未知的DICOM关键字: {}", name)))?;
    Ok(DictionaryTag::new(
        DicomTag::new(tag.group(), tag.element()),
        name.trim(),
    ))
}

/// 解析一个角色列表，并去掉列表内的重复标签
fn resolve_tags(names: &[String]) -> Result<Vec<DictionaryTag>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let tag = resolve_tag(name)?;
        if seen.insert(tag.tag) {
            out.push(tag);
        }
    }
    Ok(out)
}
