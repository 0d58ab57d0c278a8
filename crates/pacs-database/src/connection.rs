//! 数据库连接管理

use crate::queries::DatabaseQueries;
use pacs_core::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// 数据库连接池
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// 连接并确保表结构存在
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if !database_url.contains(":memory:") {
            // 读快照与提交互不阻塞
            options = options.journal_mode(SqliteJournalMode::Wal);
        } else {
            // 每个连接各自一个内存库，只能用单连接且不能被回收
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        DatabaseQueries::new(&db).create_tables().await?;
        info!("Connected to entity index: {}", database_url);
        Ok(db)
    }

    /// 单连接内存库，连接关闭即丢弃
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
