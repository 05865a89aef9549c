// 接入服务API数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 文件清单条目（会话初始化时上报）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifestEntry {
    /// 文件名
    pub name: String,

    /// 文件大小（字节）
    pub size: u64,

    /// MIME 类型
    pub mime_type: String,
}

/// 会话元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// 标题
    pub title: String,

    /// 描述
    #[serde(default)]
    pub description: String,

    /// 页面模板
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// 作者名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,

    /// 访问密码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// 过期时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
}

/// 会话初始化请求体
#[derive(Debug, Clone, Serialize)]
pub struct InitializeRequest<'a> {
    /// 文件清单
    pub files: &'a [FileManifestEntry],

    /// 会话元数据
    #[serde(flatten)]
    pub metadata: &'a SessionMetadata,
}

/// 服务端下发的单文件上传描述符
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// 文件ID（会话内唯一）
    pub file_id: String,

    /// 分片大小（服务端可覆盖客户端默认值）
    pub chunk_size: u64,

    /// 总分片数
    pub total_chunks: usize,
}

/// 会话初始化响应
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResponse {
    /// 错误码（0表示成功）
    #[serde(default)]
    pub errno: i32,

    /// 错误信息
    #[serde(default)]
    pub errmsg: String,

    /// 会话ID
    #[serde(default)]
    pub session_id: String,

    /// 每个文件的上传描述符（顺序与清单一致）
    #[serde(default)]
    pub files: Vec<FileDescriptor>,

    /// 遥测推送地址（可选，缺省表示服务端未开启推送）
    #[serde(default)]
    pub websocket_url: Option<String>,
}

impl InitializeResponse {
    pub fn is_success(&self) -> bool {
        self.errno == 0 && !self.session_id.is_empty()
    }
}

/// 分片上传确认
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAck {
    /// 是否成功
    pub success: bool,

    /// 错误信息
    #[serde(default)]
    pub error: Option<String>,
}

/// 会话状态轮询响应中的单文件条目
#[derive(Debug, Clone, Deserialize)]
pub struct FileStatusEntry {
    /// 文件ID
    pub file_id: String,

    /// 阶段（字符串形式，未知取值由调用方容忍）
    pub stage: String,

    /// 上传进度 (0.0 - 100.0)
    #[serde(default)]
    pub upload_progress: f64,

    /// 优化进度 (0.0 - 100.0)
    #[serde(default)]
    pub optimization_progress: Option<f64>,

    /// 预览地址
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl FileStatusEntry {
    /// 该条目代表的进度：优化阶段报优化进度，否则报上传进度
    pub fn effective_progress(&self) -> f64 {
        self.optimization_progress.unwrap_or(self.upload_progress)
    }
}

/// 会话状态轮询响应
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusResponse {
    /// 错误码（0表示成功）
    #[serde(default)]
    pub errno: i32,

    /// 错误信息
    #[serde(default)]
    pub errmsg: String,

    /// 每个文件的状态
    #[serde(default)]
    pub files: Vec<FileStatusEntry>,
}

/// 会话完成响应
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    /// 错误码（0表示成功）
    #[serde(default)]
    pub errno: i32,

    /// 错误信息
    #[serde(default)]
    pub errmsg: String,

    /// 发布后的访问地址
    #[serde(default)]
    pub url: String,

    /// 短标识
    #[serde(default)]
    pub slug: String,
}

impl CompleteResponse {
    pub fn is_success(&self) -> bool {
        self.errno == 0 && !self.url.is_empty()
    }
}

/// 分片上传错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 参数错误（不可重试）
    BadRequest,
    /// 权限不足（不可重试）
    Forbidden,
    /// 会话或文件不存在（不可重试）
    NotFound,
    /// 分片过大（不可重试）
    PayloadTooLarge,
    /// 未知错误
    Unknown,
}

impl ChunkErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChunkErrorKind::Network
                | ChunkErrorKind::Timeout
                | ChunkErrorKind::ServerError
                | ChunkErrorKind::RateLimited
        )
    }
}

/// 错误分类：按错误文本归类传输层/服务端错误
pub fn classify_chunk_error(error: &anyhow::Error) -> ChunkErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("timeout") || error_str.contains("timed out") {
        ChunkErrorKind::Timeout
    } else if error_str.contains("connection")
        || error_str.contains("network")
        || error_str.contains("dns")
    {
        ChunkErrorKind::Network
    } else if error_str.contains("429") || error_str.contains("rate limit") {
        ChunkErrorKind::RateLimited
    } else if error_str.contains("404") || error_str.contains("not found") {
        ChunkErrorKind::NotFound
    } else if error_str.contains("403") || error_str.contains("forbidden") {
        ChunkErrorKind::Forbidden
    } else if error_str.contains("413") || error_str.contains("too large") {
        ChunkErrorKind::PayloadTooLarge
    } else if error_str.contains("400") || error_str.contains("bad request") {
        ChunkErrorKind::BadRequest
    } else if error_str.contains("500")
        || error_str.contains("502")
        || error_str.contains("503")
        || error_str.contains("internal server")
    {
        ChunkErrorKind::ServerError
    } else {
        ChunkErrorKind::Unknown
    }
}
