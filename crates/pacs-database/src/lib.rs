//! # PACS数据库模块
//!
//! 实体索引：基于SQLite保存检查/序列/影像/帧记录及其像素位置，批次写入在单个事务内完成。

pub mod connection;
pub mod models;
pub mod queries;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use models::*;
pub use queries::{DatabaseQueries, IndexSnapshot};
