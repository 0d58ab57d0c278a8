//! PACS存储服务主程序

use anyhow::Context;
use clap::Parser;
use pacs_config::{AttributeCatalog, ConfigManager, ConfigSchemaReader};
use pacs_storage::{LocalFetchService, StorageDevice};
use pacs_web::{AppState, WebServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// PACS存储服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "PACS 归档存储服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件中的设置
    #[arg(short, long)]
    log_level: Option<String>,

    /// 监听端口，覆盖配置文件中的设置
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::new(args.config.as_deref()).context("加载配置失败")?;
    let config = manager.config().clone();

    // 初始化日志
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("启动PACS存储服务...");
    info!("  设备: {}", config.storage.device_name);
    info!("  根目录: {}", config.storage.root_path);
    info!("  属性目录: {}", config.schema.path);

    let catalog = AttributeCatalog::initialize(&ConfigSchemaReader::new(config.schema.path.clone()))
        .context("加载属性目录失败")?;
    let device = StorageDevice::open(&config.storage, catalog)
        .await
        .context("打开存储设备失败")?;
    let fetch = Arc::new(LocalFetchService::from_config(device.clone(), &config.fetch));

    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .with_context(|| format!("无效的监听地址: {}:{}", config.server.host, port))?;
    let server = WebServer::new(
        addr,
        AppState {
            device: device.clone(),
            fetch,
        },
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("服务器运行失败: {}", e);
                device.close().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    device.close().await;
    info!("PACS存储服务已停止");
    Ok(())
}
