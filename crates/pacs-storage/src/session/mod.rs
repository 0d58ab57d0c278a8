//! 存储会话
//!
//! 会话在暂存区中累积待写入的单元，提交时一次性放置文件并在一个索引事务中发布。

mod commit;
mod composite;
mod multiframe;

pub use composite::CompositeStoreSession;
pub use multiframe::MultiFrameStoreSession;

pub(crate) use commit::{PendingUnit, StagedEntity, StagedPixel};

use pacs_core::{tags, Attributes, EntityType, PacsError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Staging,
    Committed,
    Discarded,
    /// 提交失败，与丢弃一样是终态
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::Discarded | SessionState::Failed
        )
    }
}

/// 会话专属的暂存目录，首次写入时创建
#[derive(Debug)]
pub(crate) struct StagingArea {
    dir: PathBuf,
    created: bool,
}

impl StagingArea {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            created: false,
        }
    }

    /// 暂存区中一个新的唯一文件路径，前缀只能是单个文件名成分
    pub async fn new_file(&mut self, prefix: &str, extension: &str) -> Result<PathBuf> {
        if !is_plain_component(prefix) || !is_plain_component(extension) {
            return Err(PacsError::Validation(format!(
                "暂存文件名无效: {:?}.{:?}",
                prefix, extension
            )));
        }
        if !self.created {
            tokio::fs::create_dir_all(&self.dir).await?;
            self.created = true;
        }
        Ok(self
            .dir
            .join(pacs_core::utils::unique_file_name(prefix, extension)))
    }

    /// 同步删除，供 `Drop` 使用
    pub fn remove(&mut self) {
        if !self.created {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed staging area {:?}", self.dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("清理暂存区失败 {:?}: {}", self.dir, e),
        }
        self.created = false;
    }
}

/// 只含一个普通成分的文件名片段
fn is_plain_component(part: &str) -> bool {
    let mut components = Path::new(part).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !part.contains(['/', '\\'])
}

/// 根据头部与是否带像素判断影像实体类型
pub(crate) fn classify_image(header: &Attributes, has_pixels: bool) -> EntityType {
    if !has_pixels {
        return EntityType::Leaf;
    }
    match header
        .get_trimmed(tags::NUMBER_OF_FRAMES)
        .and_then(|v| v.parse::<u32>().ok())
    {
        Some(n) if n > 1 => EntityType::MFImage,
        _ => EntityType::SFImage,
    }
}
