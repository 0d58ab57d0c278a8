//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use chrono::Utc;
use pacs_core::{Attributes, DicomTag, EntityType, Identifier, Level, PacsError, Result};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const SELECT_ENTITY: &str = "SELECT entity_key, entity_type, parent_key, study_uid, series_uid, \
     sop_instance_uid, frame_index, sop_class_uid, attributes, header_path, pixel_location, \
     translation_status, created_at, updated_at FROM entities";

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                entity_key TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                parent_key TEXT,
                study_uid TEXT NOT NULL,
                series_uid TEXT,
                sop_instance_uid TEXT,
                frame_index INTEGER,
                sop_class_uid TEXT,
                attributes TEXT NOT NULL,
                header_path TEXT,
                pixel_location TEXT,
                translation_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 可查询/索引查询标签的值
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_attributes (
                entity_key TEXT NOT NULL REFERENCES entities(entity_key) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (entity_key, tag)
            )
        "#,
        )
        .execute(pool)
        .await?;

        self.create_indexes().await?;
        info!("Database tables created successfully");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_entities_parent_key ON entities(parent_key)",
            "CREATE INDEX IF NOT EXISTS idx_entities_sop_instance_uid ON entities(sop_instance_uid)",
            "CREATE INDEX IF NOT EXISTS idx_entity_attributes_tag_value ON entity_attributes(tag, value)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }
        Ok(())
    }

    // ========== 批次写入 ==========

    /// 在一个事务中应用整个批次，任何一步失败都不会留下部分结果
    pub async fn apply(&self, batch: &IndexBatch) -> Result<AppliedBatch> {
        let mut seen = HashSet::new();
        for op in batch.ops() {
            if let IndexOp::Upsert { record, .. } = op {
                if !seen.insert(record.identifier.key()) {
                    return Err(PacsError::constraint(format!(
                        "批次中重复的实体: {}",
                        record.identifier
                    )));
                }
            }
        }

        let mut tx: Transaction<'_, Sqlite> = self.pool.pool().begin().await?;
        let mut applied = AppliedBatch::default();
        let mut old_files: Vec<PathBuf> = Vec::new();
        let mut new_files: HashSet<PathBuf> = HashSet::new();

        for op in batch.ops() {
            match op {
                IndexOp::Upsert {
                    record,
                    query_attributes,
                } => {
                    new_files.extend(record.file_paths());
                    old_files.extend(upsert_entity(&mut tx, record, query_attributes).await?);
                    applied.upserted += 1;
                }
                IndexOp::Update {
                    identifier,
                    delta,
                    query_tags,
                } => {
                    update_entity(&mut tx, identifier, delta, query_tags).await?;
                    applied.updated += 1;
                }
            }
        }

        tx.commit().await?;

        let mut unique = HashSet::new();
        applied.superseded_files = old_files
            .into_iter()
            .filter(|p| !new_files.contains(p) && unique.insert(p.clone()))
            .collect();
        debug!(
            "Applied index batch: {} upserted, {} updated, {} superseded files",
            applied.upserted,
            applied.updated,
            applied.superseded_files.len()
        );
        Ok(applied)
    }

    // ========== 读取 ==========

    pub async fn get(&self, identifier: &Identifier) -> Result<Option<EntityRecord>> {
        let mut conn = self.pool.pool().acquire().await?;
        fetch_in_tx(&mut conn, &identifier.key()).await
    }

    /// 直接子实体，帧按帧序排列
    pub async fn children(&self, identifier: &Identifier) -> Result<Vec<EntityRecord>> {
        let mut conn = self.pool.pool().acquire().await?;
        children_in(&mut conn, identifier).await
    }

    pub async fn series_in_study(&self, study_uid: &str) -> Result<Vec<EntityRecord>> {
        self.children(&Identifier::study(study_uid)).await
    }

    pub async fn images_in_series(&self, series: &Identifier) -> Result<Vec<EntityRecord>> {
        require_level(series, Level::Series)?;
        self.children(series).await
    }

    pub async fn frames_of(&self, image: &Identifier) -> Result<Vec<EntityRecord>> {
        require_level(image, Level::Image)?;
        Ok(only_frames(self.children(image).await?))
    }

    /// 打开一个只读快照，快照内的多次读取看到同一个已提交状态
    pub async fn snapshot(&self) -> Result<IndexSnapshot> {
        Ok(IndexSnapshot {
            tx: self.pool.pool().begin().await?,
        })
    }

    pub async fn find_by_sop_instance_uid(&self, sop_instance_uid: &str) -> Result<Option<EntityRecord>> {
        let row = sqlx::query_as::<_, DbEntity>(&format!(
            "{} WHERE sop_instance_uid = ? AND entity_type IN ('SF_IMAGE', 'MF_IMAGE', 'LEAF')",
            SELECT_ENTITY
        ))
        .bind(sop_instance_uid)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(EntityRecord::try_from).transpose()
    }

    /// 按可查询标签的值查找某层级的实体
    pub async fn find_by_attribute(
        &self,
        level: Level,
        tag: DicomTag,
        value: &str,
    ) -> Result<Vec<EntityRecord>> {
        let rows = sqlx::query_as::<_, DbEntity>(
            "SELECT e.entity_key, e.entity_type, e.parent_key, e.study_uid, e.series_uid, \
             e.sop_instance_uid, e.frame_index, e.sop_class_uid, e.attributes, e.header_path, \
             e.pixel_location, e.translation_status, e.created_at, e.updated_at \
             FROM entities e JOIN entity_attributes a ON a.entity_key = e.entity_key \
             WHERE a.tag = ? AND a.value = ? ORDER BY e.entity_key",
        )
        .bind(tag.to_string())
        .bind(value)
        .fetch_all(self.pool.pool())
        .await?;

        let mut records = Vec::new();
        for row in rows {
            let record = EntityRecord::try_from(row)?;
            if record.entity_type.level() == Some(level) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// 某实体在索引中保存的可查询属性
    pub async fn query_attributes(&self, identifier: &Identifier) -> Result<Attributes> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT tag, value FROM entity_attributes WHERE entity_key = ?")
                .bind(identifier.key())
                .fetch_all(self.pool.pool())
                .await?;
        let mut attributes = Attributes::new();
        for (tag, value) in rows {
            match tag.parse::<DicomTag>() {
                Ok(tag) => attributes.set(tag, value),
                Err(_) => warn!("索引中存在无效标签: {}", tag),
            }
        }
        Ok(attributes)
    }
}

/// 只读事务中的索引视图
///
/// 持有一个连接直到 `finish` 或被释放，期间不要在同一任务里再通过连接池读写索引。
pub struct IndexSnapshot {
    tx: Transaction<'static, Sqlite>,
}

impl IndexSnapshot {
    pub async fn get(&mut self, identifier: &Identifier) -> Result<Option<EntityRecord>> {
        fetch_in_tx(&mut self.tx, &identifier.key()).await
    }

    pub async fn children(&mut self, identifier: &Identifier) -> Result<Vec<EntityRecord>> {
        children_in(&mut self.tx, identifier).await
    }

    pub async fn series_in_study(&mut self, study_uid: &str) -> Result<Vec<EntityRecord>> {
        self.children(&Identifier::study(study_uid)).await
    }

    pub async fn images_in_series(&mut self, series: &Identifier) -> Result<Vec<EntityRecord>> {
        require_level(series, Level::Series)?;
        self.children(series).await
    }

    pub async fn frames_of(&mut self, image: &Identifier) -> Result<Vec<EntityRecord>> {
        require_level(image, Level::Image)?;
        Ok(only_frames(self.children(image).await?))
    }

    /// 结束快照并归还连接
    pub async fn finish(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn require_level(identifier: &Identifier, level: Level) -> Result<()> {
    if identifier.level() != level {
        return Err(PacsError::Validation(format!(
            "不是{}标识: {}",
            level, identifier
        )));
    }
    Ok(())
}

fn only_frames(children: Vec<EntityRecord>) -> Vec<EntityRecord> {
    children
        .into_iter()
        .filter(|r| r.entity_type == EntityType::Frame)
        .collect()
}

async fn children_in(conn: &mut SqliteConnection, identifier: &Identifier) -> Result<Vec<EntityRecord>> {
    let rows = sqlx::query_as::<_, DbEntity>(&format!(
        "{} WHERE parent_key = ? ORDER BY frame_index, created_at, entity_key",
        SELECT_ENTITY
    ))
    .bind(identifier.key())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(EntityRecord::try_from).collect()
}

async fn fetch_in_tx(conn: &mut SqliteConnection, key: &str) -> Result<Option<EntityRecord>> {
    let row = sqlx::query_as::<_, DbEntity>(&format!("{} WHERE entity_key = ?", SELECT_ENTITY))
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(EntityRecord::try_from).transpose()
}

/// 校验层级、父实体与 SOP Instance UID 唯一性
async fn check_constraints(conn: &mut SqliteConnection, record: &EntityRecord) -> Result<()> {
    let identifier = &record.identifier;
    if record.entity_type.level() != Some(identifier.level()) {
        return Err(PacsError::constraint(format!(
            "实体类型 {} 与标识层级不符: {}",
            record.entity_type.as_str(),
            identifier
        )));
    }

    let parent_type = match identifier.parent() {
        Some(parent) => fetch_in_tx(conn, &parent.key())
            .await?
            .map(|p| p.entity_type)
            .ok_or_else(|| PacsError::constraint(format!("父实体不存在: {}", parent)))?,
        None => EntityType::None,
    };
    if !record.entity_type.accepts_parent(parent_type) {
        return Err(PacsError::constraint(format!(
            "{} 的父实体类型 {} 无效",
            identifier,
            parent_type.as_str()
        )));
    }

    if record.entity_type.is_image() {
        if let Some(sop) = identifier.sop_instance_uid() {
            let conflict: Option<(String,)> = sqlx::query_as(
                "SELECT entity_key FROM entities WHERE sop_instance_uid = ? \
                 AND entity_type IN ('SF_IMAGE', 'MF_IMAGE', 'LEAF') AND entity_key != ?",
            )
            .bind(sop)
            .bind(identifier.key())
            .fetch_optional(&mut *conn)
            .await?;
            if let Some((existing,)) = conflict {
                return Err(PacsError::constraint(format!(
                    "SOP Instance UID {} 已存在于 {}",
                    sop, existing
                )));
            }
        }
    }
    Ok(())
}

/// 写入实体，返回被替换掉的旧文件
async fn upsert_entity(
    conn: &mut SqliteConnection,
    record: &EntityRecord,
    query_attributes: &Attributes,
) -> Result<Vec<PathBuf>> {
    check_constraints(conn, record).await?;

    let key = record.identifier.key();
    let existing = fetch_in_tx(conn, &key).await?;
    let merge = matches!(record.entity_type, EntityType::Study | EntityType::Series);

    let mut superseded = Vec::new();
    let mut attributes = record.attributes.clone();
    let mut created_at = record.created_at;
    if let Some(old) = &existing {
        created_at = old.created_at;
        if merge {
            attributes = old.attributes.clone();
            attributes.merge(&record.attributes);
        } else {
            superseded.extend(old.file_paths());
        }
    }

    // 重新写入影像时，旧的帧记录一并移除
    if record.entity_type.is_image() {
        let frames = sqlx::query_as::<_, DbEntity>(&format!(
            "{} WHERE parent_key = ? AND entity_type = 'FRAME'",
            SELECT_ENTITY
        ))
        .bind(&key)
        .fetch_all(&mut *conn)
        .await?;
        for frame in frames {
            superseded.extend(EntityRecord::try_from(frame)?.file_paths());
        }
        sqlx::query(
            "DELETE FROM entity_attributes WHERE entity_key IN \
             (SELECT entity_key FROM entities WHERE parent_key = ? AND entity_type = 'FRAME')",
        )
        .bind(&key)
        .execute(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM entities WHERE parent_key = ? AND entity_type = 'FRAME'")
            .bind(&key)
            .execute(&mut *conn)
            .await?;
    }

    let pixel_location = record
        .pixel_location
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let identifier = &record.identifier;
    sqlx::query(
        r#"
        INSERT INTO entities (
            entity_key, entity_type, parent_key, study_uid, series_uid, sop_instance_uid,
            frame_index, sop_class_uid, attributes, header_path, pixel_location,
            translation_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_key) DO UPDATE SET
            entity_type = excluded.entity_type,
            sop_class_uid = COALESCE(excluded.sop_class_uid, entities.sop_class_uid),
            attributes = excluded.attributes,
            header_path = excluded.header_path,
            pixel_location = excluded.pixel_location,
            translation_status = excluded.translation_status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&key)
    .bind(record.entity_type.as_str())
    .bind(identifier.parent().map(|p| p.key()))
    .bind(identifier.study_uid())
    .bind(identifier.series_uid())
    .bind(identifier.sop_instance_uid())
    .bind(identifier.frame_index().map(i64::from))
    .bind(record.sop_class_uid.as_deref())
    .bind(serde_json::to_string(&attributes)?)
    .bind(
        record
            .header_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
    )
    .bind(pixel_location)
    .bind(record.translation_status.map(|s| s.as_str()))
    .bind(created_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if !merge {
        sqlx::query("DELETE FROM entity_attributes WHERE entity_key = ?")
            .bind(&key)
            .execute(&mut *conn)
            .await?;
    }
    upsert_query_attributes(conn, &key, query_attributes).await?;

    debug!("Upserted {} ({})", identifier, record.entity_type.as_str());
    Ok(superseded)
}

async fn update_entity(
    conn: &mut SqliteConnection,
    identifier: &Identifier,
    delta: &Attributes,
    query_tags: &[DicomTag],
) -> Result<()> {
    let key = identifier.key();
    let existing = fetch_in_tx(conn, &key)
        .await?
        .ok_or_else(|| PacsError::constraint(format!("要更新的实体不存在: {}", identifier)))?;

    let mut attributes = existing.attributes;
    attributes.merge(delta);
    sqlx::query("UPDATE entities SET attributes = ?, updated_at = ? WHERE entity_key = ?")
        .bind(serde_json::to_string(&attributes)?)
        .bind(Utc::now())
        .bind(&key)
        .execute(&mut *conn)
        .await?;

    upsert_query_attributes(conn, &key, &delta.subset(query_tags)).await?;
    debug!("Updated {} with {} attributes", identifier, delta.len());
    Ok(())
}

async fn upsert_query_attributes(
    conn: &mut SqliteConnection,
    key: &str,
    attributes: &Attributes,
) -> Result<()> {
    for (tag, value) in attributes.iter() {
        sqlx::query(
            "INSERT INTO entity_attributes (entity_key, tag, value) VALUES (?, ?, ?) \
             ON CONFLICT(entity_key, tag) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(tag.to_string())
        .bind(value.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
