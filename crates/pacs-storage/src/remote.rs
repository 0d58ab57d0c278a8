//! 获取服务的远程调用桩
//!
//! 通过HTTP调用另一进程中的 `/api/fetch`；连接失败与超时是传输错误，
//! 服务端返回的错误按错误类别重建。

use crate::fetch::FetchService;
use async_trait::async_trait;
use pacs_core::{ErrorBody, FetchInformation, FetchRequest, Identifier, LoadingMode, PacsError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// 远程获取客户端
#[derive(Debug, Clone)]
pub struct RemoteFetchClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteFetchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacsError::transport(format!("无法创建HTTP客户端: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/fetch", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl FetchService for RemoteFetchClient {
    async fn fetch_as_stream(
        &self,
        identifiers: &[Identifier],
        loading_mode: LoadingMode,
        skip_loading_frames: bool,
    ) -> Result<Vec<FetchInformation>> {
        let request = FetchRequest {
            identifiers: identifiers.to_vec(),
            loading_mode,
            skip_loading_frames,
        };
        debug!("POST {} ({} identifiers)", self.endpoint, identifiers.len());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PacsError::transport(format!("调用 {} 失败: {}", self.endpoint, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Vec<FetchInformation>>()
                .await
                .map_err(|e| PacsError::transport(format!("无法解析获取结果: {}", e)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PacsError::transport(format!("读取错误响应失败: {}", e)))?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(error) => {
                warn!("Remote fetch failed with {}: {}", status, error.message);
                Err(error.into())
            }
            Err(_) => Err(PacsError::transport(format!(
                "{} 返回 {}",
                self.endpoint, status
            ))),
        }
    }
}
