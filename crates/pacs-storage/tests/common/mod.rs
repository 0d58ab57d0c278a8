#![allow(dead_code)]

use pacs_config::{AttributeCatalog, ConfigSchemaReader, StorageConfig};
use pacs_core::{tags, Attributes};
use pacs_storage::{LocalDeviceStoreFactory, StorageDevice};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const SCHEMA: &str = r#"
sop_class_uids = ["1.2.840.10008.5.1.4.1.1.7"]

[levels.study]
fast_access = ["PatientID", "StudyDate"]
queryable = ["PatientID"]

[levels.series]
fast_access = ["PatientID", "Modality"]
queryable = ["Modality"]

[levels.image]
fast_access = ["InstanceNumber", "Rows", "Columns"]
queryable = ["InstanceNumber"]
skip_modify = ["SOPInstanceUID", "InstanceNumber"]

[levels.frame]
fast_access = ["InstanceNumber"]
"#;

pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

pub struct TestDevice {
    pub dir: TempDir,
    pub device: Arc<StorageDevice>,
    pub factory: LocalDeviceStoreFactory,
}

impl TestDevice {
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// 数据目录下的文件数
    pub fn data_files(&self) -> usize {
        count_files(&self.data_dir())
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

pub async fn open_device() -> TestDevice {
    open_device_with_index(|_| ("sqlite::memory:".to_string(), 1)).await
}

/// 索引放在临时目录中的文件库，读写可以走不同的连接
pub async fn open_file_backed_device() -> TestDevice {
    open_device_with_index(|dir| (format!("sqlite://{}", dir.join("index.db").display()), 4)).await
}

async fn open_device_with_index(index: impl FnOnce(&Path) -> (String, u32)) -> TestDevice {
    let dir = tempfile::tempdir().unwrap();
    let (database_url, max_connections) = index(dir.path());
    let device = open_at(dir.path(), database_url, max_connections).await;
    let factory = LocalDeviceStoreFactory::new(device.clone());
    TestDevice {
        dir,
        device,
        factory,
    }
}

/// 在同一根目录上再打开一个设备，索引使用新的内存库
pub async fn reopen_device(device: &TestDevice) -> Arc<StorageDevice> {
    open_at(device.dir.path(), "sqlite::memory:".to_string(), 1).await
}

async fn open_at(root: &Path, database_url: String, max_connections: u32) -> Arc<StorageDevice> {
    let config = StorageConfig {
        device_name: "test".to_string(),
        root_path: root.display().to_string(),
        staging_path: None,
        database_url,
        max_connections,
    };
    let catalog = Arc::new(AttributeCatalog::load(&ConfigSchemaReader::from_toml_str(SCHEMA)).unwrap());
    StorageDevice::open(&config, catalog).await.unwrap()
}

pub fn image_header(study: &str, series: &str, sop: &str) -> Attributes {
    Attributes::new()
        .with(tags::STUDY_INSTANCE_UID, study)
        .with(tags::SERIES_INSTANCE_UID, series)
        .with(tags::SOP_INSTANCE_UID, sop)
        .with(tags::SOP_CLASS_UID, SECONDARY_CAPTURE)
        .with(tags::PATIENT_ID, "PAT001")
        .with(tags::STUDY_DATE, "20240101")
        .with(tags::MODALITY, "OT")
        .with(tags::INSTANCE_NUMBER, "1")
        .with(tags::ROWS, "2")
        .with(tags::COLUMNS, "2")
        .with(tags::BITS_ALLOCATED, "8")
}
