//! Web服务器

use axum::{
    routing::{get, post},
    Router,
};
use pacs_core::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{fetch_as_stream, health, AppState};
use crate::wado::retrieve_frame;

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            app: create_app(state),
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, self.app).await
    }
}

/// 在已绑定的监听器上提供服务
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    info!("Starting web server on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health))
        // 获取服务
        .route("/api/fetch", post(fetch_as_stream))
        // 按帧检索
        .route(
            "/wado/studies/:study/series/:series/instances/:instance/frames/:frame",
            get(retrieve_frame),
        )
        .with_state(state)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}
