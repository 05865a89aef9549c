// 会话定义
//
// 会话状态机、会话值对象与上传域错误

use crate::ingest::{InitializeResponse, SessionMetadata};
use crate::uploader::chunk;
use crate::uploader::file::FileTransfer;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// 会话状态
///
/// uninitialized → initializing → active → completing → completed，
/// failed / cancelled 可从 initializing、active、completing 进入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 未初始化
    Uninitialized,
    /// 初始化中
    Initializing,
    /// 传输中
    Active,
    /// 完成调用中
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// 状态机合法迁移表
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, to),
            (Uninitialized, Initializing)
                | (Initializing, Active)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Active, Completing)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Completing, Completed)
                | (Completing, Failed)
                | (Completing, Cancelled)
        )
    }
}

/// 发布结果：会话完成后服务端返回的资源定位
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedResource {
    /// 访问地址
    pub url: String,
    /// 短标识
    pub slug: String,
}

/// 一次多文件上传会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    /// 本地引用ID（会话ID下发前的日志追踪用）
    pub client_ref: String,
    /// 服务端下发的会话ID，初始化成功后不可变
    #[serde(default)]
    pub session_id: String,
    /// 登记的文件，顺序即清单顺序
    pub files: Vec<FileTransfer>,
    /// 会话状态
    pub state: SessionState,
    /// 会话元数据
    pub metadata: SessionMetadata,
    /// 遥测推送地址（初始化响应下发，可选）
    #[serde(default)]
    pub websocket_url: Option<String>,
}

impl TransferSession {
    /// 创建空会话
    pub fn empty() -> Self {
        Self {
            client_ref: Uuid::new_v4().to_string(),
            session_id: String::new(),
            files: Vec::new(),
            state: SessionState::Uninitialized,
            metadata: SessionMetadata::default(),
            websocket_url: None,
        }
    }

    /// 状态迁移，非法迁移返回错误
    pub fn transition(&mut self, to: SessionState) -> Result<(), UploadError> {
        if !self.state.can_transition_to(to) {
            return Err(UploadError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// 绑定初始化响应：记录会话ID，把服务端描述符套到各文件上
    ///
    /// 描述符数量必须与清单一致；total_chunks 以本地按
    /// ceil(size / chunk_size) 推导为准，与服务端不一致时告警。
    pub fn bind_initialize_response(
        &mut self,
        response: &InitializeResponse,
    ) -> Result<(), UploadError> {
        if response.files.len() != self.files.len() {
            return Err(UploadError::InitializeFailed(format!(
                "描述符数量不匹配: 清单 {} 个文件, 服务端返回 {} 个",
                self.files.len(),
                response.files.len()
            )));
        }

        self.session_id = response.session_id.clone();
        self.websocket_url = response.websocket_url.clone();

        for (file, descriptor) in self.files.iter_mut().zip(response.files.iter()) {
            let derived = chunk::chunk_count(file.size, descriptor.chunk_size.max(1));
            if derived != descriptor.total_chunks {
                warn!(
                    "文件 {} 分片数不一致: 服务端={}, 本地推导={}，以本地为准",
                    file.name, descriptor.total_chunks, derived
                );
            }
            file.bind_descriptor(
                descriptor.file_id.clone(),
                descriptor.chunk_size.max(1),
                derived,
            );
        }

        Ok(())
    }

    /// 按文件ID查索引
    pub fn file_index_by_id(&self, file_id: &str) -> Option<usize> {
        self.files.iter().position(|f| f.file_id == file_id)
    }

    /// 完成前置条件：每个文件的分片是否都已确认
    pub fn all_files_fully_acked(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.all_chunks_acked())
    }
}

/// 上传域错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// 初始化失败（对本次尝试致命，需要重开会话）
    InitializeFailed(String),
    /// 分片失败（携带足够上下文供调用方按索引重新推导重传）
    ChunkFailed {
        file_id: String,
        chunk_index: usize,
        message: String,
    },
    /// 完成调用失败（可重发，分片不会重传）
    CompleteFailed(String),
    /// 完成前置条件不满足：仍有文件分片未全部确认
    PreconditionNotMet { pending_files: usize },
    /// 非法状态迁移
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    /// 用户取消（不算错误路径的失败）
    Cancelled,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::InitializeFailed(msg) => write!(f, "会话初始化失败: {}", msg),
            UploadError::ChunkFailed {
                file_id,
                chunk_index,
                message,
            } => write!(
                f,
                "文件 {} 分片 #{} 上传失败: {}",
                file_id, chunk_index, message
            ),
            UploadError::CompleteFailed(msg) => write!(f, "会话完成调用失败: {}", msg),
            UploadError::PreconditionNotMet { pending_files } => write!(
                f,
                "会话尚不可完成: 还有 {} 个文件分片未全部确认",
                pending_files
            ),
            UploadError::InvalidTransition { from, to } => write!(
                f,
                "非法状态迁移: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            UploadError::Cancelled => write!(f, "上传已取消"),
        }
    }
}

impl std::error::Error for UploadError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::FileDescriptor;
    use std::path::PathBuf;

    fn session_with_files(sizes: &[u64]) -> TransferSession {
        let mut session = TransferSession::empty();
        session.files = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                FileTransfer::new(
                    PathBuf::from(format!("./f{}", i)),
                    format!("f{}", i),
                    size,
                    "application/octet-stream".to_string(),
                )
            })
            .collect();
        session
    }

    fn init_response(descriptors: Vec<FileDescriptor>) -> InitializeResponse {
        let json = serde_json::json!({
            "errno": 0,
            "session_id": "sess-1",
            "files": descriptors.iter().map(|d| serde_json::json!({
                "file_id": d.file_id,
                "chunk_size": d.chunk_size,
                "total_chunks": d.total_chunks,
            })).collect::<Vec<_>>(),
            "websocket_url": "wss://example.com/ws",
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = TransferSession::empty();
        assert_eq!(session.state, SessionState::Uninitialized);

        session.transition(SessionState::Initializing).unwrap();
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Completing).unwrap();
        session.transition(SessionState::Completed).unwrap();
        assert!(session.state.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = TransferSession::empty();

        // 不能跳过初始化直接进入传输
        let err = session.transition(SessionState::Active).unwrap_err();
        assert_eq!(
            err,
            UploadError::InvalidTransition {
                from: SessionState::Uninitialized,
                to: SessionState::Active,
            }
        );

        // 终态之后不能再迁移
        session.transition(SessionState::Initializing).unwrap();
        session.transition(SessionState::Failed).unwrap();
        assert!(session.transition(SessionState::Active).is_err());
    }

    #[test]
    fn test_cancel_reachable_from_mid_states() {
        for mid in [
            SessionState::Initializing,
            SessionState::Active,
            SessionState::Completing,
        ] {
            assert!(mid.can_transition_to(SessionState::Cancelled));
            assert!(mid.can_transition_to(SessionState::Failed));
        }
        assert!(!SessionState::Uninitialized.can_transition_to(SessionState::Cancelled));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Cancelled));
    }

    #[test]
    fn test_bind_initialize_response() {
        let mut session = session_with_files(&[100, 0]);
        let response = init_response(vec![
            FileDescriptor {
                file_id: "f-a".to_string(),
                chunk_size: 40,
                total_chunks: 3,
            },
            FileDescriptor {
                file_id: "f-b".to_string(),
                chunk_size: 40,
                total_chunks: 1,
            },
        ]);

        session.bind_initialize_response(&response).unwrap();
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.websocket_url.as_deref(), Some("wss://example.com/ws"));
        assert_eq!(session.files[0].file_id, "f-a");
        assert_eq!(session.files[0].total_chunks, 3);
        // 零字节文件仍占一个分片
        assert_eq!(session.files[1].total_chunks, 1);
        assert_eq!(session.file_index_by_id("f-b"), Some(1));
    }

    #[test]
    fn test_bind_rejects_descriptor_count_mismatch() {
        let mut session = session_with_files(&[100]);
        let response = init_response(vec![]);
        assert!(matches!(
            session.bind_initialize_response(&response),
            Err(UploadError::InitializeFailed(_))
        ));
    }

    #[test]
    fn test_bind_prefers_local_chunk_derivation() {
        // 服务端 total_chunks 与本地 ceil 推导不一致时以本地为准
        let mut session = session_with_files(&[100]);
        let response = init_response(vec![FileDescriptor {
            file_id: "f-a".to_string(),
            chunk_size: 40,
            total_chunks: 99,
        }]);
        session.bind_initialize_response(&response).unwrap();
        assert_eq!(session.files[0].total_chunks, 3);
    }

    #[test]
    fn test_all_files_fully_acked() {
        let mut session = session_with_files(&[100, 80]);
        let response = init_response(vec![
            FileDescriptor {
                file_id: "f-a".to_string(),
                chunk_size: 40,
                total_chunks: 3,
            },
            FileDescriptor {
                file_id: "f-b".to_string(),
                chunk_size: 40,
                total_chunks: 2,
            },
        ]);
        session.bind_initialize_response(&response).unwrap();
        assert!(!session.all_files_fully_acked());

        session.files[0].acked_chunks = 3;
        assert!(!session.all_files_fully_acked());

        session.files[1].acked_chunks = 2;
        assert!(session.all_files_fully_acked());
    }

    #[test]
    fn test_error_display() {
        let err = UploadError::ChunkFailed {
            file_id: "f-1".to_string(),
            chunk_index: 2,
            message: "超时".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("f-1"));
        assert!(text.contains("#2"));
    }
}
