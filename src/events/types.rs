//! 会话事件类型定义
//!
//! 定义上传会话生命周期内对外发布的全部事件，调用方通过事件通道订阅

use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：阶段变更
    Medium = 1,
    /// 高优先级：完成、失败、取消等关键事件
    High = 2,
}

/// 上传会话事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 会话初始化完成
    Initialized {
        session_id: String,
        file_count: usize,
    },
    /// 单文件进度更新
    FileProgress {
        file_id: String,
        file_index: usize,
        progress: f64,
        acked_chunks: usize,
        total_chunks: usize,
    },
    /// 单文件阶段变更（遥测通道驱动）
    FileStageChanged {
        file_id: String,
        old_stage: String,
        new_stage: String,
    },
    /// 单文件全部分片确认
    FileCompleted {
        file_id: String,
        file_index: usize,
    },
    /// 单文件失败
    FileFailed {
        file_id: String,
        file_index: usize,
        error: String,
    },
    /// 整体进度更新（按字节加权）
    OverallProgress {
        progress: f64,
        estimated_seconds_remaining: u64,
    },
    /// 会话完成，附发布地址
    Completed {
        session_id: String,
        url: String,
        slug: String,
    },
    /// 会话失败
    Failed {
        session_id: String,
        error: String,
    },
    /// 会话取消
    Cancelled {
        session_id: String,
    },
}

impl SessionEvent {
    /// 事件关联的文件ID（会话级事件返回 None）
    pub fn file_id(&self) -> Option<&str> {
        match self {
            SessionEvent::FileProgress { file_id, .. } => Some(file_id),
            SessionEvent::FileStageChanged { file_id, .. } => Some(file_id),
            SessionEvent::FileCompleted { file_id, .. } => Some(file_id),
            SessionEvent::FileFailed { file_id, .. } => Some(file_id),
            _ => None,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            SessionEvent::FileProgress { .. } => EventPriority::Low,
            SessionEvent::OverallProgress { .. } => EventPriority::Low,
            SessionEvent::FileStageChanged { .. } => EventPriority::Medium,
            SessionEvent::Initialized { .. } => EventPriority::Medium,
            SessionEvent::FileCompleted { .. }
            | SessionEvent::FileFailed { .. }
            | SessionEvent::Completed { .. }
            | SessionEvent::Failed { .. }
            | SessionEvent::Cancelled { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            SessionEvent::Initialized { .. } => "initialized",
            SessionEvent::FileProgress { .. } => "file_progress",
            SessionEvent::FileStageChanged { .. } => "file_stage_changed",
            SessionEvent::FileCompleted { .. } => "file_completed",
            SessionEvent::FileFailed { .. } => "file_failed",
            SessionEvent::OverallProgress { .. } => "overall_progress",
            SessionEvent::Completed { .. } => "completed",
            SessionEvent::Failed { .. } => "failed",
            SessionEvent::Cancelled { .. } => "cancelled",
        }
    }
}
