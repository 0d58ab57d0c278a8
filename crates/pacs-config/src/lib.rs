//! # PACS配置模块
//!
//! 服务配置加载，以及存储会话建立索引所依赖的属性目录。

pub mod catalog;
pub mod config;
pub mod provider;
pub mod reader;
pub mod schema;

pub use catalog::AttributeCatalog;
pub use config::{ConfigManager, FetchConfig, PacsConfig, ServerConfig, StorageConfig};
pub use provider::StudySeriesAttributeProvider;
pub use reader::{ConfigSchemaReader, SchemaReader, DEFAULT_SCHEMA_RESOURCE};
pub use schema::{DictionaryTag, Schema};
