//! 遥测事件定义
//!
//! 服务端处理阶段的异步通知。仅供参考展示，不作为完成依据：
//! 文件是否传完只认分片确认。

use crate::ingest::FileStatusEntry;
use crate::uploader::file::FileStage;
use serde::{Deserialize, Serialize};

/// 服务端阶段通知
///
/// 推送与轮询两条路径产出同一种事件，下游合并逻辑不区分来源。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// 会话ID（会话级订阅里服务端可能省略）
    #[serde(default)]
    pub session_id: String,
    /// 文件ID
    pub file_id: String,
    /// 阶段（字符串形式，未知取值被容忍并忽略）
    pub stage: String,
    /// 该阶段进度 (0.0 - 100.0)
    #[serde(default)]
    pub progress: f64,
    /// 预览地址（预览就绪后下发）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// 附加说明
    #[serde(default)]
    pub message: String,
}

impl NotificationEvent {
    /// 解析阶段，未知取值返回 None
    pub fn parsed_stage(&self) -> Option<FileStage> {
        FileStage::parse(&self.stage)
    }

    /// 是否属于指定会话（缺省 session_id 视为本会话）
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id.is_empty() || self.session_id == session_id
    }

    /// 由轮询的状态条目合成事件（与推送事件走同一条合并路径）
    pub fn from_status_entry(session_id: &str, entry: &FileStatusEntry) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_id: entry.file_id.clone(),
            stage: entry.stage.clone(),
            progress: entry.effective_progress(),
            preview_url: entry.preview_url.clone(),
            message: String::new(),
        }
    }
}
