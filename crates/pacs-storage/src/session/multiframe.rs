//! 多帧影像存储会话

use super::commit::commit_units;
use super::{PendingUnit, SessionState, StagedEntity, StagedPixel, StagingArea};
use crate::device::StorageDevice;
use pacs_core::{tags, Attributes, EntityType, Identifier, InMemoryPixelInformation, Level, PacsError, Result};
use pacs_dicom::write_header;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct StagedFrame {
    /// 该帧覆盖公共头部的属性
    overrides: Attributes,
    pixels: InMemoryPixelInformation,
}

/// 构建单个多帧影像的会话
///
/// 帧按追加顺序编号（第一次调用为第 0 帧），像素暂存在设备内存区域池中。
/// 提交时影像头部与全部帧在同一个索引事务中发布。
pub struct MultiFrameStoreSession {
    id: String,
    device: Arc<StorageDevice>,
    state: SessionState,
    staging: StagingArea,
    identifier: Identifier,
    common_header: Attributes,
    region: String,
    frames: Vec<StagedFrame>,
}

impl MultiFrameStoreSession {
    pub(crate) fn new(device: Arc<StorageDevice>, common_header: Attributes) -> Result<Self> {
        let identifier = Identifier::from_attributes(Level::Image, &common_header)?;
        let id = uuid::Uuid::new_v4().to_string();
        let staging = StagingArea::new(device.session_staging(&id));
        let region = device.memory().create("mf");
        info!(
            "Created multi-frame store session {} for {} (region {})",
            id, identifier, region
        );
        Ok(Self {
            id,
            device,
            state: SessionState::Open,
            staging,
            identifier,
            common_header,
            region,
            frames: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// 已暂存的帧，按帧序排列
    pub fn frames(&self) -> Vec<InMemoryPixelInformation> {
        self.frames.iter().map(|f| f.pixels.clone()).collect()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(PacsError::invalid_state(self.state, operation));
        }
        Ok(())
    }

    /// 追加一帧：帧自己的属性与像素
    pub fn store_frame(&mut self, frame_header: &Attributes, pixels: &[u8]) -> Result<InMemoryPixelInformation> {
        self.ensure_open("store_frame")?;
        let info = self.device.memory().append(&self.region, pixels)?;
        self.frames.push(StagedFrame {
            overrides: frame_header.clone(),
            pixels: info.clone(),
        });
        self.state = SessionState::Staging;
        debug!(
            "Session {} staged frame {} ({} bytes at offset {})",
            self.id,
            self.frames.len() - 1,
            info.pixel_length,
            info.pixel_offset
        );
        Ok(info)
    }

    /// 只追加下一帧的像素，帧属性沿用公共头部
    pub fn store_frame_pixel_data(&mut self, pixels: &[u8]) -> Result<InMemoryPixelInformation> {
        self.store_frame(&Attributes::new(), pixels)
    }

    /// 发布整个多帧影像；无论成功与否都释放内存区域
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        let result = self.commit_frames().await;
        self.device.memory().release(&self.region);
        self.staging.remove();
        self.frames.clear();

        match result {
            Ok(()) => {
                self.state = SessionState::Committed;
                Ok(())
            }
            Err(e) => {
                error!("多帧会话 {} 提交失败: {}", self.id, e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn commit_frames(&mut self) -> Result<()> {
        if self.frames.is_empty() {
            return Err(PacsError::constraint(format!(
                "多帧影像没有任何帧: {}",
                self.identifier
            )));
        }

        let mut header = self.common_header.clone();
        header.set(tags::NUMBER_OF_FRAMES, self.frames.len().to_string());
        let prefix = self
            .identifier
            .sop_instance_uid()
            .unwrap_or("multiframe")
            .to_string();
        let header_file = self.staging.new_file(&prefix, "dcm").await?;
        write_header(header_file.clone(), header.clone()).await?;

        // 所有帧按顺序拼接到一个像素文件
        let pixel_file = self.staging.new_file(&prefix, "pix").await?;
        let mut file = tokio::fs::File::create(&pixel_file).await?;
        let mut units = Vec::with_capacity(self.frames.len() + 1);
        let mut offset = 0u64;
        for (index, frame) in self.frames.iter().enumerate() {
            let bytes = self.device.memory().read(&frame.pixels)?;
            file.write_all(&bytes).await?;

            let mut frame_header = header.clone();
            frame_header.merge(&frame.overrides);
            units.push(PendingUnit::Store(StagedEntity {
                identifier: self.identifier.frame(index as u32)?,
                entity_type: EntityType::Frame,
                header: frame_header,
                header_file: None,
                pixel: Some(StagedPixel::File {
                    staged: pixel_file.clone(),
                    offset,
                    length: frame.pixels.pixel_length,
                    embedded: false,
                }),
            }));
            offset += frame.pixels.pixel_length;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        units.insert(
            0,
            PendingUnit::Store(StagedEntity {
                identifier: self.identifier.clone(),
                entity_type: EntityType::MFImage,
                header,
                header_file: Some(header_file),
                pixel: None,
            }),
        );
        commit_units(&self.device, &self.id, units).await?;
        Ok(())
    }

    /// 放弃所有暂存帧；提交之后调用属于编程错误
    pub fn discard_session(&mut self) -> Result<()> {
        self.ensure_open("discard_session")?;
        let dropped = self.frames.len();
        self.frames.clear();
        self.device.memory().release(&self.region);
        self.staging.remove();
        self.state = SessionState::Discarded;
        info!("Discarded multi-frame session {} ({} frames)", self.id, dropped);
        Ok(())
    }
}

impl Drop for MultiFrameStoreSession {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if !self.frames.is_empty() {
            warn!(
                "多帧会话 {} 未提交即被释放，丢弃 {} 帧",
                self.id,
                self.frames.len()
            );
        }
        self.device.memory().release(&self.region);
        self.staging.remove();
    }
}
