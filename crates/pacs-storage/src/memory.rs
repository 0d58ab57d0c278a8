//! 共享内存区域池
//!
//! 多帧会话把帧像素暂存在命名区域中，提交或丢弃后释放。

use pacs_core::{InMemoryPixelInformation, PacsError, Result};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// 命名内存区域集合
#[derive(Debug, Default)]
pub struct MemoryRegionPool {
    regions: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryRegionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        self.regions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
        self.regions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 创建一个空区域，返回区域名
    pub fn create(&self, prefix: &str) -> String {
        let name = format!("{}-{}", prefix, uuid::Uuid::new_v4());
        self.write_guard().insert(name.clone(), Vec::new());
        debug!("Created memory region {}", name);
        name
    }

    /// 追加数据，返回这段数据在区域中的位置
    pub fn append(&self, name: &str, data: &[u8]) -> Result<InMemoryPixelInformation> {
        let mut regions = self.write_guard();
        let region = regions
            .get_mut(name)
            .ok_or_else(|| PacsError::NotFound(format!("内存区域不存在: {}", name)))?;
        let offset = region.len() as u64;
        region.extend_from_slice(data);
        Ok(InMemoryPixelInformation::new(name, offset, data.len() as u64))
    }

    /// 按描述读取；区域已释放或描述越界都视为数据损坏
    pub fn read(&self, info: &InMemoryPixelInformation) -> Result<Vec<u8>> {
        let regions = self.read_guard();
        let region = regions.get(&info.mmf_name).ok_or_else(|| {
            PacsError::data_corrupt(format!("内存区域已释放: {}", info.mmf_name))
        })?;
        info.check_within(region.len() as u64)?;
        let start = info.pixel_offset as usize;
        let end = start + info.pixel_length as usize;
        Ok(region[start..end].to_vec())
    }

    pub fn size(&self, name: &str) -> Option<u64> {
        self.read_guard().get(name).map(|r| r.len() as u64)
    }

    /// 释放区域，返回区域是否存在
    pub fn release(&self, name: &str) -> bool {
        let released = self.write_guard().remove(name).is_some();
        if released {
            debug!("Released memory region {}", name);
        }
        released
    }

    pub fn region_count(&self) -> usize {
        self.read_guard().len()
    }
}
