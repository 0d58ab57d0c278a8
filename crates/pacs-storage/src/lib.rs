//! # PACS存储模块
//!
//! 存储设备、复合/多帧存储会话，以及把像素位置解析为本地可读句柄的获取服务。

pub mod blob;
pub mod device;
pub mod fetch;
pub mod memory;
pub mod remote;
pub mod session;

pub use blob::{ApplicationBlob, ObjectStoreBlob};
pub use device::{DeviceStoreFactory, LocalDeviceStoreFactory, StorageDevice};
pub use fetch::{FetchService, LocalFetchService, RemotePixelSource, WadoPixelSource};
pub use memory::MemoryRegionPool;
pub use remote::RemoteFetchClient;
pub use session::{CompositeStoreSession, MultiFrameStoreSession, SessionState};
