//! 会话提交
//!
//! 顺序：整理计划 → 校验头部与暂存文件 → 放置文件 → 单事务写索引 → 清理被替换的文件。
//! 索引事务失败时删除已放置的文件，索引中不会留下任何本会话的记录。

use crate::device::StorageDevice;
use crate::fetch::PIXEL_CACHE_BLOB;
use pacs_core::utils::unique_file_name;
use pacs_core::{tags, Attributes, EntityType, Identifier, PacsError, PixelLocation, RemoteReference, Result};
use pacs_database::{AppliedBatch, EntityRecord, IndexBatch};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// 暂存单元引用的像素
#[derive(Debug, Clone)]
pub(crate) enum StagedPixel {
    /// 暂存文件中的一段
    File {
        staged: PathBuf,
        offset: u64,
        length: u64,
        embedded: bool,
    },
    Remote(RemoteReference),
}

/// 等待提交的实体
#[derive(Debug, Clone)]
pub(crate) struct StagedEntity {
    pub identifier: Identifier,
    pub entity_type: EntityType,
    pub header: Attributes,
    /// 暂存区中的头部文件
    pub header_file: Option<PathBuf>,
    pub pixel: Option<StagedPixel>,
}

#[derive(Debug, Clone)]
pub(crate) enum PendingUnit {
    Store(StagedEntity),
    Update {
        identifier: Identifier,
        delta: Attributes,
    },
}

/// 标识本身携带的 UID 属性
fn identity_attributes(identifier: &Identifier) -> Attributes {
    let mut attrs = Attributes::new().with(tags::STUDY_INSTANCE_UID, identifier.study_uid());
    if let Some(series) = identifier.series_uid() {
        attrs.set(tags::SERIES_INSTANCE_UID, series);
    }
    if let Some(sop) = identifier.sop_instance_uid() {
        attrs.set(tags::SOP_INSTANCE_UID, sop);
    }
    attrs
}

/// 按层级排好序的提交计划；检查与序列记录已去重合并
#[derive(Debug, Default)]
struct CommitPlan {
    studies: Vec<StagedEntity>,
    series: Vec<StagedEntity>,
    images: Vec<StagedEntity>,
    frames: Vec<StagedEntity>,
    updates: Vec<(Identifier, Attributes)>,
}

impl CommitPlan {
    fn build(device: &StorageDevice, units: Vec<PendingUnit>) -> Result<Self> {
        let provider = device.catalog().study_series();
        let study_tags: Vec<_> = provider.study_attributes().iter().map(|t| t.tag).collect();
        let series_tags: Vec<_> = provider.series_attributes().iter().map(|t| t.tag).collect();

        let mut plan = CommitPlan::default();
        let mut seen = HashSet::new();
        for unit in units {
            let entity = match unit {
                PendingUnit::Update { identifier, delta } => {
                    plan.updates.push((identifier, delta));
                    continue;
                }
                PendingUnit::Store(entity) => entity,
            };

            if entity.entity_type.is_image() || entity.entity_type == EntityType::Series {
                let study = entity.identifier.study_identifier();
                let mut header = entity.header.subset(&study_tags);
                header.merge(&identity_attributes(&study));
                merge_into(&mut plan.studies, derived(study, EntityType::Study, header));
            }
            if entity.entity_type.is_image() {
                if let Some(series) = entity.identifier.series_identifier() {
                    let mut header = entity.header.subset(&series_tags);
                    header.merge(&identity_attributes(&series));
                    merge_into(&mut plan.series, derived(series, EntityType::Series, header));
                }
            }

            match entity.entity_type {
                EntityType::Study => merge_into(&mut plan.studies, entity),
                EntityType::Series => merge_into(&mut plan.series, entity),
                EntityType::SFImage | EntityType::MFImage | EntityType::Leaf | EntityType::Frame => {
                    if !seen.insert(entity.identifier.clone()) {
                        return Err(PacsError::constraint(format!(
                            "同一会话中重复的实体: {}",
                            entity.identifier
                        )));
                    }
                    if entity.entity_type == EntityType::Frame {
                        plan.frames.push(entity);
                    } else {
                        plan.images.push(entity);
                    }
                }
                EntityType::None | EntityType::Unknown => {
                    return Err(PacsError::constraint(format!(
                        "无法存储类型为 {} 的实体: {}",
                        entity.entity_type.as_str(),
                        entity.identifier
                    )));
                }
            }
        }
        Ok(plan)
    }

    fn entities(&self) -> impl Iterator<Item = &StagedEntity> {
        self.studies
            .iter()
            .chain(&self.series)
            .chain(&self.images)
            .chain(&self.frames)
    }
}

fn derived(identifier: Identifier, entity_type: EntityType, header: Attributes) -> StagedEntity {
    StagedEntity {
        identifier,
        entity_type,
        header,
        header_file: None,
        pixel: None,
    }
}

fn merge_into(entities: &mut Vec<StagedEntity>, entity: StagedEntity) {
    match entities.iter_mut().find(|e| e.identifier == entity.identifier) {
        Some(existing) => existing.header.merge(&entity.header),
        None => entities.push(entity),
    }
}

/// 提交前确认暂存文件仍然覆盖声明的像素范围
async fn verify_staged(entity: &StagedEntity) -> Result<()> {
    if let Some(header) = &entity.header_file {
        tokio::fs::metadata(header).await?;
    }
    if let Some(StagedPixel::File {
        staged,
        offset,
        length,
        ..
    }) = &entity.pixel
    {
        let actual = tokio::fs::metadata(staged).await?.len();
        let declared = offset.saturating_add(*length);
        if declared > actual {
            return Err(PacsError::TruncatedSource {
                path: staged.display().to_string(),
                declared,
                actual,
            });
        }
    }
    Ok(())
}

/// 已放置到数据目录的文件，用于失败回滚
#[derive(Debug, Default)]
struct Placement {
    moved: HashMap<PathBuf, PathBuf>,
    placed: Vec<PathBuf>,
}

impl Placement {
    async fn place(
        &mut self,
        device: &StorageDevice,
        identifier: &Identifier,
        staged: &Path,
    ) -> Result<PathBuf> {
        if let Some(target) = self.moved.get(staged) {
            return Ok(target.clone());
        }
        let dir = device.target_dir(identifier);
        tokio::fs::create_dir_all(&dir).await?;
        let extension = staged.extension().and_then(|e| e.to_str()).unwrap_or("bin");
        let prefix = identifier.sop_instance_uid().unwrap_or("entity");
        let target = dir.join(unique_file_name(prefix, extension));

        move_file(staged, &target).await?;
        debug!("Placed {:?} -> {:?}", staged, target);
        self.placed.push(target.clone());
        self.moved.insert(staged.to_path_buf(), target.clone());
        Ok(target)
    }

    async fn rollback(self) {
        for path in self.placed {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("回滚时删除文件失败 {:?}: {}", path, e);
            }
        }
    }
}

/// 同一文件系统内直接改名，否则复制后删除源文件
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    if let Err(e) = tokio::fs::remove_file(from).await {
        warn!("删除暂存文件失败 {:?}: {}", from, e);
    }
    Ok(())
}

async fn build_record(
    device: &StorageDevice,
    entity: &StagedEntity,
    placement: &mut Placement,
) -> Result<(EntityRecord, Attributes)> {
    let level = entity.identifier.level();
    let catalog = device.catalog();

    let mut record = EntityRecord::new(entity.identifier.clone(), entity.entity_type);
    let mut attributes = entity.header.subset(&catalog.fast_access_tags(level));
    attributes.merge(&identity_attributes(&entity.identifier));
    record.attributes = attributes;
    record.sop_class_uid = entity
        .header
        .get_trimmed(tags::SOP_CLASS_UID)
        .map(str::to_string);

    if let Some(header) = &entity.header_file {
        record.header_path = Some(placement.place(device, &entity.identifier, header).await?);
    }
    record.pixel_location = match &entity.pixel {
        Some(StagedPixel::File {
            staged,
            offset,
            length,
            embedded,
        }) => Some(PixelLocation::File {
            path: placement.place(device, &entity.identifier, staged).await?,
            offset: *offset,
            length: *length,
            embedded: *embedded,
        }),
        Some(StagedPixel::Remote(reference)) => Some(PixelLocation::Remote(reference.clone())),
        None => None,
    };
    if matches!(entity.entity_type, EntityType::SFImage | EntityType::MFImage) {
        record.translation_status = Some(device.translation().evaluate(&entity.header));
    }

    let query_attributes = entity.header.subset(&catalog.indexed_tags(level));
    Ok((record, query_attributes))
}

/// 提交一组暂存单元
pub(crate) async fn commit_units(
    device: &StorageDevice,
    session_id: &str,
    units: Vec<PendingUnit>,
) -> Result<AppliedBatch> {
    info!("Committing session {} ({} units)", session_id, units.len());
    let plan = CommitPlan::build(device, units)?;

    for entity in plan.entities() {
        if let Some(level) = entity.entity_type.level() {
            device
                .validator()
                .validate_header(level, &entity.header)
                .into_result(&entity.identifier.to_string())?;
        }
        verify_staged(entity).await?;
    }

    let mut placement = Placement::default();
    let batch = match build_batch(device, &plan, &mut placement).await {
        Ok(batch) => batch,
        Err(e) => {
            placement.rollback().await;
            return Err(e);
        }
    };

    let applied = match device.index().apply(&batch).await {
        Ok(applied) => applied,
        Err(e) => {
            error!("会话 {} 索引写入失败，回滚已放置文件: {}", session_id, e);
            placement.rollback().await;
            return Err(e);
        }
    };

    for path in &applied.superseded_files {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed superseded file {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除被替换的文件失败 {:?}: {}", path, e),
        }
    }
    for entity in plan.images.iter().chain(&plan.frames) {
        if let Err(e) = device
            .blob()
            .delete(Some(&entity.identifier), PIXEL_CACHE_BLOB)
            .await
        {
            warn!("清除像素缓存失败 {}: {}", entity.identifier, e);
        }
    }

    info!(
        "Session {} committed: {} upserted, {} updated",
        session_id, applied.upserted, applied.updated
    );
    Ok(applied)
}

async fn build_batch(
    device: &StorageDevice,
    plan: &CommitPlan,
    placement: &mut Placement,
) -> Result<IndexBatch> {
    let mut batch = IndexBatch::new();
    for entity in plan.entities() {
        let (record, query_attributes) = build_record(device, entity, placement).await?;
        batch.upsert(record, query_attributes);
    }
    for (identifier, delta) in &plan.updates {
        let query_tags = device.catalog().indexed_tags(identifier.level());
        batch.update(identifier.clone(), delta.clone(), query_tags);
    }
    Ok(batch)
}
