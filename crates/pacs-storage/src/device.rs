//! 存储设备与会话工厂

use crate::blob::{ApplicationBlob, ObjectStoreBlob};
use crate::memory::MemoryRegionPool;
use crate::session::{CompositeStoreSession, MultiFrameStoreSession};
use pacs_config::{AttributeCatalog, StorageConfig};
use pacs_core::{Attributes, Identifier, PacsError, Result};
use pacs_database::{DatabasePool, DatabaseQueries};
use pacs_dicom::{DicomValidator, TranslationPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DATA_DIR: &str = "data";
const BLOB_DIR: &str = "blobs";
/// 获取服务落地内存或远程像素的目录，位于暂存区内
const FETCH_DIR: &str = "fetch";

/// 一个存储设备：数据目录、暂存区、实体索引、数据块存储与内存区域池
pub struct StorageDevice {
    name: String,
    root: PathBuf,
    data_dir: PathBuf,
    staging: PathBuf,
    index: DatabasePool,
    blob: Arc<dyn ApplicationBlob>,
    memory: Arc<MemoryRegionPool>,
    catalog: Arc<AttributeCatalog>,
    validator: DicomValidator,
    translation: TranslationPolicy,
}

impl std::fmt::Debug for StorageDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDevice")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("staging", &self.staging)
            .finish()
    }
}

impl StorageDevice {
    /// 按配置打开设备，目录不存在时创建
    pub async fn open(config: &StorageConfig, catalog: Arc<AttributeCatalog>) -> Result<Arc<Self>> {
        if config.root_path.trim().is_empty() {
            return Err(PacsError::configuration("存储根目录不能为空"));
        }
        let root = PathBuf::from(&config.root_path);
        let data_dir = root.join(DATA_DIR);
        let staging = config.staging_dir();
        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&staging).await?;
        // 上一个进程留下的落地副本已没有持有者
        remove_fetch_dir(&staging.join(FETCH_DIR)).await;

        let index = DatabasePool::connect(&config.database_url, config.max_connections).await?;
        let blob: Arc<dyn ApplicationBlob> = Arc::new(ObjectStoreBlob::local(root.join(BLOB_DIR))?);

        info!(
            "Opened storage device '{}' at {:?} (staging {:?})",
            config.device_name, root, staging
        );
        Ok(Arc::new(Self {
            name: config.device_name.clone(),
            root,
            data_dir,
            staging,
            index,
            blob,
            memory: Arc::new(MemoryRegionPool::new()),
            catalog,
            validator: DicomValidator::new(),
            translation: TranslationPolicy::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_area(&self) -> &Path {
        &self.staging
    }

    pub fn index(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(&self.index)
    }

    pub fn blob(&self) -> &Arc<dyn ApplicationBlob> {
        &self.blob
    }

    pub fn memory(&self) -> &Arc<MemoryRegionPool> {
        &self.memory
    }

    pub fn catalog(&self) -> &Arc<AttributeCatalog> {
        &self.catalog
    }

    pub fn validator(&self) -> &DicomValidator {
        &self.validator
    }

    pub fn translation(&self) -> &TranslationPolicy {
        &self.translation
    }

    /// 实体文件的最终目录 `data/{study}/{series}`
    pub(crate) fn target_dir(&self, identifier: &Identifier) -> PathBuf {
        let dir = self.data_dir.join(identifier.study_uid());
        match identifier.series_uid() {
            Some(series) => dir.join(series),
            None => dir,
        }
    }

    /// 会话专用的暂存目录
    pub(crate) fn session_staging(&self, session_id: &str) -> PathBuf {
        self.staging.join(format!("session-{}", session_id))
    }

    /// 获取服务落地副本的目录
    ///
    /// 其中的文件归设备所有，返回给调用方的读取位置在设备关闭前有效。
    pub(crate) fn fetch_dir(&self) -> PathBuf {
        self.staging.join(FETCH_DIR)
    }

    /// 关闭索引连接并删除获取服务的落地副本
    pub async fn close(&self) {
        self.index.close().await;
        remove_fetch_dir(&self.fetch_dir()).await;
    }
}

async fn remove_fetch_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed fetch copies in {:?}", dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("清理获取副本目录失败 {:?}: {}", dir, e),
    }
}

/// 创建绑定到某个设备的存储会话
pub trait DeviceStoreFactory: Send + Sync {
    /// 每次调用都返回一个新会话
    fn create_composite_store_session(&self) -> Result<CompositeStoreSession>;

    /// 公共头部必须能确定影像标识
    fn create_multi_frame_store_session(
        &self,
        common_header: Attributes,
    ) -> Result<MultiFrameStoreSession>;

    /// 会话临时落地数据必须使用的暂存目录
    fn staging_area_location(&self) -> &Path;
}

/// 本地设备的会话工厂
#[derive(Debug, Clone)]
pub struct LocalDeviceStoreFactory {
    device: Arc<StorageDevice>,
}

impl LocalDeviceStoreFactory {
    pub fn new(device: Arc<StorageDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<StorageDevice> {
        &self.device
    }
}

impl DeviceStoreFactory for LocalDeviceStoreFactory {
    fn create_composite_store_session(&self) -> Result<CompositeStoreSession> {
        Ok(CompositeStoreSession::new(self.device.clone()))
    }

    fn create_multi_frame_store_session(
        &self,
        common_header: Attributes,
    ) -> Result<MultiFrameStoreSession> {
        MultiFrameStoreSession::new(self.device.clone(), common_header)
    }

    fn staging_area_location(&self) -> &Path {
        self.device.staging_area()
    }
}
