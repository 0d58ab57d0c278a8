//! 应用数据块存储
//!
//! 按实体标识分区的键值块存储；不带标识的操作落在设备级全局命名空间。

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use pacs_core::{Identifier, PacsError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const ENTITY_PREFIX: &str = "entities";
const GLOBAL_PREFIX: &str = "global";

/// 数据块存储接口
#[async_trait]
pub trait ApplicationBlob: Send + Sync {
    async fn exists(&self, identifier: Option<&Identifier>, name: &str) -> Result<bool>;

    async fn fetch(&self, identifier: Option<&Identifier>, name: &str) -> Result<Bytes>;

    /// 某实体名下的全部数据块，按名称排序
    async fn fetch_all(&self, identifier: &Identifier) -> Result<Vec<(String, Bytes)>>;

    async fn store(&self, identifier: Option<&Identifier>, name: &str, data: Bytes) -> Result<()>;

    /// 删除不存在的数据块不是错误
    async fn delete(&self, identifier: Option<&Identifier>, name: &str) -> Result<()>;

    /// 数据块对应的本地文件，非文件系统后端返回 `None`
    fn local_path(&self, identifier: Option<&Identifier>, name: &str) -> Option<PathBuf>;
}

/// 基于 object_store 的实现
#[derive(Debug)]
pub struct ObjectStoreBlob {
    store: Arc<dyn ObjectStore>,
    root: Option<PathBuf>,
}

fn storage_error(e: object_store::Error) -> PacsError {
    PacsError::Storage(e.to_string())
}

impl ObjectStoreBlob {
    /// 本地目录后端，目录不存在时创建
    pub fn local(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root).map_err(storage_error)?;
        Ok(Self {
            store: Arc::new(store),
            root: Some(root.to_path_buf()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            root: None,
        }
    }

    fn entity_parts(identifier: &Identifier) -> Vec<String> {
        let mut parts = vec![ENTITY_PREFIX.to_string(), identifier.study_uid().to_string()];
        if let Some(series) = identifier.series_uid() {
            parts.push(series.to_string());
        }
        if let Some(sop) = identifier.sop_instance_uid() {
            parts.push(sop.to_string());
        }
        if let Some(frame) = identifier.frame_index() {
            parts.push(format!("frame-{}", frame));
        }
        parts
    }

    fn location(identifier: Option<&Identifier>, name: &str) -> ObjectPath {
        let mut parts = match identifier {
            Some(id) => Self::entity_parts(id),
            None => vec![GLOBAL_PREFIX.to_string()],
        };
        parts.push(name.to_string());
        ObjectPath::from_iter(parts)
    }
}

#[async_trait]
impl ApplicationBlob for ObjectStoreBlob {
    async fn exists(&self, identifier: Option<&Identifier>, name: &str) -> Result<bool> {
        match self.store.head(&Self::location(identifier, name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn fetch(&self, identifier: Option<&Identifier>, name: &str) -> Result<Bytes> {
        let location = Self::location(identifier, name);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                PacsError::NotFound(format!("数据块不存在: {}", location))
            }
            other => storage_error(other),
        })?;
        result.bytes().await.map_err(storage_error)
    }

    async fn fetch_all(&self, identifier: &Identifier) -> Result<Vec<(String, Bytes)>> {
        let prefix = ObjectPath::from_iter(Self::entity_parts(identifier));
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(storage_error)?;

        let mut names: Vec<String> = listing
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .collect();
        names.sort();

        let mut blobs = Vec::with_capacity(names.len());
        for name in names {
            let data = self.fetch(Some(identifier), &name).await?;
            blobs.push((name, data));
        }
        Ok(blobs)
    }

    async fn store(&self, identifier: Option<&Identifier>, name: &str, data: Bytes) -> Result<()> {
        let location = Self::location(identifier, name);
        debug!("Storing blob {} ({} bytes)", location, data.len());
        self.store
            .put(&location, data)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn delete(&self, identifier: Option<&Identifier>, name: &str) -> Result<()> {
        match self.store.delete(&Self::location(identifier, name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }

    fn local_path(&self, identifier: Option<&Identifier>, name: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let location = Self::location(identifier, name);
        Some(location.parts().fold(root.clone(), |path, part| {
            path.join(part.as_ref())
        }))
    }
}
