//! # PACS Web模块
//!
//! 通过HTTP暴露获取服务与按帧检索，使本归档可以作为另一归档的WADO源。

pub mod handlers;
pub mod server;
pub mod wado;

pub use handlers::{ApiError, AppState};
pub use server::{create_app, WebServer};
