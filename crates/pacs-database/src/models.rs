//! 数据库模型

use chrono::{DateTime, Utc};
use pacs_core::{
    Attributes, DicomTag, EntityType, Identifier, ImageTranslationStatus, PacsError,
    PixelLocation, Result,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;

/// 数据库实体表
#[derive(Debug, FromRow)]
pub struct DbEntity {
    pub entity_key: String,
    pub entity_type: String,
    pub parent_key: Option<String>,
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub frame_index: Option<i64>,
    pub sop_class_uid: Option<String>,
    pub attributes: String, // JSON
    pub header_path: Option<String>,
    pub pixel_location: Option<String>, // JSON
    pub translation_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbEntity> for EntityRecord {
    type Error = PacsError;

    fn try_from(db: DbEntity) -> Result<Self> {
        let pixel_location = db
            .pixel_location
            .as_deref()
            .map(serde_json::from_str::<PixelLocation>)
            .transpose()?;
        Ok(EntityRecord {
            identifier: Identifier::from_key(&db.entity_key)?,
            entity_type: EntityType::parse(&db.entity_type),
            sop_class_uid: db.sop_class_uid,
            attributes: serde_json::from_str(&db.attributes)?,
            header_path: db.header_path.map(PathBuf::from),
            pixel_location,
            translation_status: db
                .translation_status
                .as_deref()
                .and_then(ImageTranslationStatus::parse),
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

/// 索引中的一个实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identifier: Identifier,
    pub entity_type: EntityType,
    pub sop_class_uid: Option<String>,
    /// 快速访问属性
    pub attributes: Attributes,
    pub header_path: Option<PathBuf>,
    pub pixel_location: Option<PixelLocation>,
    pub translation_status: Option<ImageTranslationStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(identifier: Identifier, entity_type: EntityType) -> Self {
        let now = Utc::now();
        Self {
            identifier,
            entity_type,
            sop_class_uid: None,
            attributes: Attributes::new(),
            header_path: None,
            pixel_location: None,
            translation_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 记录引用的本地文件
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(header) = &self.header_path {
            paths.push(header.clone());
        }
        if let Some(PixelLocation::File { path, .. }) = &self.pixel_location {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

/// 批次中的一个索引操作
#[derive(Debug, Clone)]
pub enum IndexOp {
    /// 写入或替换实体；检查与序列记录合并已有属性
    Upsert {
        record: EntityRecord,
        query_attributes: Attributes,
    },
    /// 对已存在实体应用增量属性
    Update {
        identifier: Identifier,
        delta: Attributes,
        query_tags: Vec<DicomTag>,
    },
}

impl IndexOp {
    pub fn identifier(&self) -> &Identifier {
        match self {
            IndexOp::Upsert { record, .. } => &record.identifier,
            IndexOp::Update { identifier, .. } => identifier,
        }
    }
}

/// 在一个事务中应用的索引批次
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    ops: Vec<IndexOp>,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: EntityRecord, query_attributes: Attributes) {
        self.ops.push(IndexOp::Upsert {
            record,
            query_attributes,
        });
    }

    pub fn update(&mut self, identifier: Identifier, delta: Attributes, query_tags: Vec<DicomTag>) {
        self.ops.push(IndexOp::Update {
            identifier,
            delta,
            query_tags,
        });
    }

    pub fn ops(&self) -> &[IndexOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// 批次应用结果
#[derive(Debug, Clone, Default)]
pub struct AppliedBatch {
    pub upserted: usize,
    pub updated: usize,
    /// 不再被任何记录引用的旧文件，提交后可删除
    pub superseded_files: Vec<PathBuf>,
}
