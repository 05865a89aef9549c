// 接入服务客户端实现

use crate::ingest::{
    ChunkAck, CompleteResponse, FileManifestEntry, InitializeRequest, InitializeResponse,
    SessionMetadata, SessionStatusResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 接入服务调用契约
///
/// 编排器只依赖这四个调用；具体传输由实现决定，
/// 测试用桩实现即可完整驱动调度与会话流程。
#[async_trait]
pub trait IngestApi: Send + Sync + 'static {
    /// 初始化会话：上报文件清单与元数据，换取会话ID与各文件上传描述符
    async fn initialize_session(
        &self,
        manifest: &[FileManifestEntry],
        metadata: &SessionMetadata,
    ) -> Result<InitializeResponse>;

    /// 上传单个分片
    async fn upload_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        chunk_index: usize,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<ChunkAck>;

    /// 轮询会话状态（遥测降级路径）
    async fn session_status(&self, session_id: &str) -> Result<SessionStatusResponse>;

    /// 完成会话：服务端合并所有文件，返回发布地址
    ///
    /// 服务端保证幂等，完成失败后可安全重发。
    async fn complete_session(&self, session_id: &str) -> Result<CompleteResponse>;
}

/// 接入服务 HTTP 客户端
#[derive(Debug, Clone)]
pub struct IngestClient {
    /// HTTP客户端
    client: Client,
    /// 服务基地址，如 https://ingest.example.com
    base_url: String,
}

impl IngestClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - 服务基地址
    /// * `request_timeout` - 单请求超时（分片超时即按失败处理，交给重试策略）
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!("初始化接入服务客户端: base_url={}", base_url);

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl IngestApi for IngestClient {
    async fn initialize_session(
        &self,
        manifest: &[FileManifestEntry],
        metadata: &SessionMetadata,
    ) -> Result<InitializeResponse> {
        let url = self.endpoint("/api/v1/sessions");
        let body = InitializeRequest {
            files: manifest,
            metadata,
        };

        debug!("初始化会话: {} 个文件, title={}", manifest.len(), metadata.title);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("会话初始化请求失败")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("会话初始化失败: HTTP {}", status);
        }

        let parsed: InitializeResponse = response
            .json()
            .await
            .context("解析会话初始化响应失败")?;

        if !parsed.is_success() {
            anyhow::bail!(
                "会话初始化被拒绝: errno={}, errmsg={}",
                parsed.errno,
                parsed.errmsg
            );
        }

        info!(
            "会话初始化成功: session_id={}, files={}, websocket={}",
            parsed.session_id,
            parsed.files.len(),
            parsed.websocket_url.is_some()
        );

        Ok(parsed)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        file_id: &str,
        chunk_index: usize,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<ChunkAck> {
        let url = self.endpoint(&format!(
            "/api/v1/sessions/{}/files/{}/chunks/{}",
            session_id, file_id, chunk_index
        ));

        let part = multipart::Part::bytes(data).file_name(format!("chunk-{}", chunk_index));
        let form = multipart::Form::new().part("chunk", part);

        let response = self
            .client
            .post(&url)
            .query(&[("is_last", is_last)])
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("分片 #{} 上传请求失败", chunk_index))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("分片 #{} 上传失败: HTTP {}", chunk_index, status);
        }

        let ack: ChunkAck = response
            .json()
            .await
            .with_context(|| format!("解析分片 #{} 确认响应失败", chunk_index))?;

        if !ack.success {
            warn!(
                "分片 #{} 被服务端拒绝: {}",
                chunk_index,
                ack.error.as_deref().unwrap_or("未知原因")
            );
        }

        Ok(ack)
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatusResponse> {
        let url = self.endpoint(&format!("/api/v1/sessions/{}/status", session_id));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("会话状态请求失败")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("会话状态查询失败: HTTP {}", status);
        }

        response.json().await.context("解析会话状态响应失败")
    }

    async fn complete_session(&self, session_id: &str) -> Result<CompleteResponse> {
        let url = self.endpoint(&format!("/api/v1/sessions/{}/complete", session_id));

        info!("发起会话完成: session_id={}", session_id);

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .context("会话完成请求失败")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("会话完成失败: HTTP {}", status);
        }

        let parsed: CompleteResponse = response.json().await.context("解析会话完成响应失败")?;

        if !parsed.is_success() {
            anyhow::bail!(
                "会话完成被拒绝: errno={}, errmsg={}",
                parsed.errno,
                parsed.errmsg
            );
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client =
            IngestClient::new("https://ingest.example.com/", Duration::from_secs(30)).unwrap();
        assert_eq!(
            client.endpoint("/api/v1/sessions"),
            "https://ingest.example.com/api/v1/sessions"
        );
    }

    #[test]
    fn test_chunk_endpoint_layout() {
        let client =
            IngestClient::new("http://127.0.0.1:9000", Duration::from_secs(30)).unwrap();
        let url = client.endpoint(&format!(
            "/api/v1/sessions/{}/files/{}/chunks/{}",
            "s-1", "f-2", 7
        ));
        assert_eq!(
            url,
            "http://127.0.0.1:9000/api/v1/sessions/s-1/files/f-2/chunks/7"
        );
    }
}
