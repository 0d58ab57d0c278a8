//! 配置管理
//!
//! 服务配置来自可选的配置文件，再叠加 `PACS__` 前缀的环境变量。

use config::{Config, Environment, File};
use pacs_core::{LoadingMode, PacsError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: PacsConfig,
    /// 配置文件路径
    config_path: Option<String>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 存储服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacsConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 存储设备配置
    pub storage: StorageConfig,
    /// 像素获取配置
    pub fetch: FetchConfig,
    /// 属性目录配置
    pub schema: SchemaConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
}

/// 存储设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 设备名称
    pub device_name: String,
    /// 数据根目录
    pub root_path: String,
    /// 暂存区目录，缺省为根目录下的 `staging`
    pub staging_path: Option<String>,
    /// 实体索引数据库
    pub database_url: String,
    /// 最大数据库连接数
    pub max_connections: u32,
}

/// 像素获取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub loading_mode: LoadingMode,
    /// 远程调用超时（秒）
    pub remote_timeout_secs: u64,
    /// 作为WADO源的远端归档地址
    pub wado_base_url: Option<String>,
}

/// 属性目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// 目录资源路径（不含扩展名时按支持的格式查找）
    pub path: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 表达式
    pub level: String,
}

impl StorageConfig {
    pub fn staging_dir(&self) -> PathBuf {
        match &self.staging_path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&self.root_path).join("staging"),
        }
    }
}

impl FetchConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

impl ConfigManager {
    /// 加载配置，未给出路径时只使用默认值与环境变量
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let manager = Self {
            config,
            config_path: config_path.map(str::to_string),
            validator: ConfigValidator::new(),
        };
        manager.validate_config()?;
        Ok(manager)
    }

    /// 从文件加载配置
    fn load_config(config_path: Option<&str>) -> Result<PacsConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| PacsError::configuration(format!("无法读取配置: {}", e)))?;

        let config: PacsConfig = settings
            .try_deserialize()
            .map_err(|e| PacsError::configuration(format!("配置格式错误: {}", e)))?;

        info!("Configuration loaded from: {}", config_path.unwrap_or("<defaults>"));
        Ok(config)
    }

    pub fn config(&self) -> &PacsConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    pub fn validate_config(&self) -> Result<()> {
        self.validator.validate(&self.config)
    }
}

/// 配置验证规则
#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&PacsConfig) -> bool,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| config.server.port != 0,
            },
            ValidationRule {
                field_path: "storage.root_path",
                validator: |config| !config.storage.root_path.trim().is_empty(),
            },
            ValidationRule {
                field_path: "storage.database_url",
                validator: |config| !config.storage.database_url.trim().is_empty(),
            },
            ValidationRule {
                field_path: "storage.max_connections",
                validator: |config| config.storage.max_connections > 0,
            },
            ValidationRule {
                field_path: "fetch.remote_timeout_secs",
                validator: |config| config.fetch.remote_timeout_secs > 0,
            },
            ValidationRule {
                field_path: "schema.path",
                validator: |config| !config.schema.path.trim().is_empty(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &PacsConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if !(rule.validator)(config) {
                error!("Configuration validation failed for {}", rule.field_path);
                return Err(PacsError::configuration(format!(
                    "配置项无效: {}",
                    rule.field_path
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8042,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            device_name: "local".to_string(),
            root_path: "./data".to_string(),
            staging_path: None,
            database_url: "sqlite://./data/index.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            loading_mode: LoadingMode::Eager,
            remote_timeout_secs: 30,
            wado_base_url: None,
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: crate::reader::DEFAULT_SCHEMA_RESOURCE.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
