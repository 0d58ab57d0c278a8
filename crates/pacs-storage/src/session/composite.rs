//! 复合对象存储会话

use super::commit::commit_units;
use super::{classify_image, PendingUnit, SessionState, StagedEntity, StagedPixel, StagingArea};
use crate::device::StorageDevice;
use pacs_core::utils::generate_dicom_uid;
use pacs_core::{
    tags, Attributes, BulkDataReference, EntityType, Identifier, Level, PacsError, RemoteReference,
    Result,
};
use pacs_dicom::{locate_pixel_data, write_header, DicomParser};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Encapsulated PDF Storage，非DICOM负载缺省使用
const ENCAPSULATED_DOCUMENT_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.104.1";

/// 复合对象存储会话
///
/// 每个 `store_*` 调用暂存一个单元，`commit` 之前都不可见。
/// 单个调用失败不影响会话中已暂存的单元；提交失败则整个会话进入终态。
/// 未提交也未丢弃就被释放的会话会删除自己的暂存目录。
pub struct CompositeStoreSession {
    id: String,
    device: Arc<StorageDevice>,
    state: SessionState,
    staging: StagingArea,
    units: Vec<PendingUnit>,
}

impl CompositeStoreSession {
    pub(crate) fn new(device: Arc<StorageDevice>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let staging = StagingArea::new(device.session_staging(&id));
        info!("Created composite store session {} on device '{}'", id, device.name());
        Self {
            id,
            device,
            state: SessionState::Open,
            staging,
            units: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 已暂存的单元数
    pub fn pending_units(&self) -> usize {
        self.units.len()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PacsError::invalid_state(self.state, operation));
        }
        Ok(())
    }

    fn push(&mut self, unit: PendingUnit) {
        self.units.push(unit);
        self.state = SessionState::Staging;
    }

    fn push_entity(&mut self, entity: StagedEntity) -> Identifier {
        let identifier = entity.identifier.clone();
        debug!(
            "Session {} staged {} ({})",
            self.id,
            identifier,
            entity.entity_type.as_str()
        );
        self.push(PendingUnit::Store(entity));
        identifier
    }

    /// 复制文件到暂存区，失败时不留下半个文件
    async fn copy_into_staging(&mut self, source: &Path, prefix: &str, extension: &str) -> Result<std::path::PathBuf> {
        let target = self.staging.new_file(prefix, extension).await?;
        if let Err(e) = tokio::fs::copy(source, &target).await {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(e.into());
        }
        Ok(target)
    }

    async fn stage_header(&mut self, identifier: &Identifier, header: &Attributes) -> Result<std::path::PathBuf> {
        let prefix = identifier.sop_instance_uid().unwrap_or("header");
        let path = self.staging.new_file(prefix, "dcm").await?;
        write_header(path.clone(), header.clone()).await?;
        Ok(path)
    }

    /// 暂存一个完整的复合对象文件，像素保持嵌在文件中
    pub async fn store_file(&mut self, composite: impl AsRef<Path>) -> Result<Identifier> {
        self.ensure_open("store_file")?;
        let source = composite.as_ref();
        let parsed = DicomParser::parse_composite(source).await?;
        let identifier = Identifier::from_attributes(Level::Image, &parsed.attributes)?;

        let prefix = identifier.sop_instance_uid().unwrap_or("composite").to_string();
        let staged = self.copy_into_staging(source, &prefix, "dcm").await?;
        let pixel = parsed.pixel.map(|p| StagedPixel::File {
            staged: staged.clone(),
            offset: p.offset,
            length: p.length,
            embedded: true,
        });
        let entity_type = classify_image(&parsed.attributes, pixel.is_some());

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type,
            header: parsed.attributes,
            header_file: Some(staged),
            pixel,
        }))
    }

    /// 暂存只有头部属性的对象
    pub async fn store_header(&mut self, header: &Attributes) -> Result<Identifier> {
        self.ensure_open("store_header")?;
        let identifier = Identifier::from_attributes(Level::Image, header)?;
        let header_file = self.stage_header(&identifier, header).await?;

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: classify_image(header, false),
            header: header.clone(),
            header_file: Some(header_file),
            pixel: None,
        }))
    }

    /// 暂存头部与调用方的像素缓冲区
    ///
    /// 缓冲区只在本次调用期间被借用，内容立即复制到暂存区。
    pub async fn store_with_pixels(&mut self, header: &Attributes, pixels: &[u8]) -> Result<Identifier> {
        self.ensure_open("store_with_pixels")?;
        let identifier = Identifier::from_attributes(Level::Image, header)?;
        let header_file = self.stage_header(&identifier, header).await?;

        let prefix = identifier.sop_instance_uid().unwrap_or("pixels").to_string();
        let pixel_file = self.staging.new_file(&prefix, "pix").await?;
        tokio::fs::write(&pixel_file, pixels).await?;

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: classify_image(header, true),
            header: header.clone(),
            header_file: Some(header_file),
            pixel: Some(StagedPixel::File {
                staged: pixel_file,
                offset: 0,
                length: pixels.len() as u64,
                embedded: false,
            }),
        }))
    }

    /// 暂存非DICOM负载（文档等），缺少的 SOP UID 会被补齐
    pub async fn store_non_dicom(&mut self, header: &Attributes, file_path: impl AsRef<Path>) -> Result<Identifier> {
        self.ensure_open("store_non_dicom")?;
        let source = file_path.as_ref();
        let size = tokio::fs::metadata(source).await?.len();

        let mut header = header.clone();
        if header.get_trimmed(tags::SOP_INSTANCE_UID).is_none() {
            header.set(tags::SOP_INSTANCE_UID, generate_dicom_uid());
        }
        if header.get_trimmed(tags::SOP_CLASS_UID).is_none() {
            header.set(tags::SOP_CLASS_UID, ENCAPSULATED_DOCUMENT_SOP_CLASS);
        }
        let identifier = Identifier::from_attributes(Level::Image, &header)?;
        let header_file = self.stage_header(&identifier, &header).await?;

        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let prefix = identifier.sop_instance_uid().unwrap_or("document").to_string();
        let payload = self.copy_into_staging(source, &prefix, &extension).await?;

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: EntityType::Leaf,
            header,
            header_file: Some(header_file),
            pixel: Some(StagedPixel::File {
                staged: payload,
                offset: 0,
                length: size,
                embedded: false,
            }),
        }))
    }

    /// 暂存像素仍嵌在复合文件中的影像
    ///
    /// `pixel_length` 为 0 时依次使用第一个批量数据引用、重新定位复合文件中的像素元素。
    /// 声明范围超出文件大小时立即以截断错误失败。
    pub async fn store_bulk(
        &mut self,
        header: &Attributes,
        bulk_data_references: &[BulkDataReference],
        composite: impl AsRef<Path>,
        pixel_offset: u64,
        pixel_length: u64,
    ) -> Result<Identifier> {
        self.ensure_open("store_bulk")?;
        let composite = composite.as_ref();
        let identifier = Identifier::from_attributes(Level::Image, header)?;
        let file_size = tokio::fs::metadata(composite).await?.len();

        for reference in bulk_data_references {
            if reference.composite_file_name != composite {
                return Err(PacsError::Validation(format!(
                    "批量数据引用指向其他文件: {:?}",
                    reference.composite_file_name
                )));
            }
            check_extent(composite, reference.pixel_offset, reference.pixel_length, file_size)?;
        }

        let extent = if pixel_length > 0 {
            Some((pixel_offset, pixel_length))
        } else if let Some(reference) = bulk_data_references.first() {
            Some((reference.pixel_offset, reference.pixel_length))
        } else {
            let source = composite.to_path_buf();
            tokio::task::spawn_blocking(move || locate_pixel_data(&source))
                .await
                .map_err(|e| PacsError::Internal(format!("定位任务失败: {}", e)))??
                .pixel
                .map(|p| (p.offset, p.length))
        };
        if let Some((offset, length)) = extent {
            check_extent(composite, offset, length, file_size)?;
        }

        let prefix = identifier.sop_instance_uid().unwrap_or("composite").to_string();
        let staged = self.copy_into_staging(composite, &prefix, "dcm").await?;
        let pixel = extent.map(|(offset, length)| StagedPixel::File {
            staged: staged.clone(),
            offset,
            length,
            embedded: true,
        });

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: classify_image(header, pixel.is_some()),
            header: header.clone(),
            header_file: Some(staged),
            pixel,
        }))
    }

    /// 暂存只有检查级属性的记录
    pub fn store_study(&mut self, header: &Attributes) -> Result<Identifier> {
        self.ensure_open("store_study")?;
        let identifier = Identifier::from_attributes(Level::Study, header)?;
        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: EntityType::Study,
            header: header.clone(),
            header_file: None,
            pixel: None,
        }))
    }

    /// 暂存只有序列级属性的记录
    pub fn store_series(&mut self, header: &Attributes) -> Result<Identifier> {
        self.ensure_open("store_series")?;
        let identifier = Identifier::from_attributes(Level::Series, header)?;
        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: EntityType::Series,
            header: header.clone(),
            header_file: None,
            pixel: None,
        }))
    }

    /// 暂存像素留在WADO或云影像服务上的影像
    pub async fn store_remote(&mut self, header: &Attributes, reference: RemoteReference) -> Result<Identifier> {
        self.ensure_open("store_remote")?;
        let identifier = Identifier::from_attributes(Level::Image, header)?;
        let header_file = self.stage_header(&identifier, header).await?;

        Ok(self.push_entity(StagedEntity {
            identifier,
            entity_type: classify_image(header, true),
            header: header.clone(),
            header_file: Some(header_file),
            pixel: Some(StagedPixel::Remote(reference)),
        }))
    }

    /// 暂存对已存在实体的增量修改，目录中标记为跳过修改的标签被忽略
    pub fn update(&mut self, identifier: &Identifier, delta: &Attributes) -> Result<()> {
        self.ensure_open("update")?;
        let level = identifier.level();
        let catalog = self.device.catalog();

        let mut filtered = Attributes::new();
        for (tag, value) in delta.iter() {
            if catalog.is_skip_modify(level, tag) {
                debug!("Ignoring skip-on-modify tag {} for {}", tag, identifier);
                continue;
            }
            filtered.set(tag, value);
        }
        self.push(PendingUnit::Update {
            identifier: identifier.clone(),
            delta: filtered,
        });
        Ok(())
    }

    /// 原子地提交所有暂存单元
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        let units = std::mem::take(&mut self.units);
        let result = commit_units(&self.device, &self.id, units).await;
        self.staging.remove();

        match result {
            Ok(_) => {
                self.state = SessionState::Committed;
                Ok(())
            }
            Err(e) => {
                error!("会话 {} 提交失败: {}", self.id, e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// 放弃所有暂存单元
    pub fn discard(&mut self) -> Result<()> {
        self.ensure_open("discard")?;
        let dropped = self.units.len();
        self.units.clear();
        self.staging.remove();
        self.state = SessionState::Discarded;
        info!("Discarded session {} ({} units)", self.id, dropped);
        Ok(())
    }
}

impl Drop for CompositeStoreSession {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if !self.units.is_empty() {
            warn!(
                "会话 {} 未提交即被释放，丢弃 {} 个暂存单元",
                self.id,
                self.units.len()
            );
        }
        self.staging.remove();
    }
}

fn check_extent(path: &Path, offset: u64, length: u64, actual: u64) -> Result<()> {
    let declared = offset.saturating_add(length);
    if declared > actual {
        return Err(PacsError::TruncatedSource {
            path: path.display().to_string(),
            declared,
            actual,
        });
    }
    Ok(())
}
