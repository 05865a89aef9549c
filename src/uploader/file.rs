// 文件传输记录
//
// 会话内单个文件的登记信息与阶段状态

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 文件传输阶段
///
/// `optimizing` / `previewing` 只在遥测通道开启时出现，
/// 普通分片传输从 `uploading` 直接进入 `complete`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStage {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 服务端优化中
    Optimizing,
    /// 服务端生成预览中
    Previewing,
    /// 已完成
    Complete,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl FileStage {
    /// 阶段名称
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStage::Pending => "pending",
            FileStage::Uploading => "uploading",
            FileStage::Optimizing => "optimizing",
            FileStage::Previewing => "previewing",
            FileStage::Complete => "complete",
            FileStage::Failed => "failed",
            FileStage::Cancelled => "cancelled",
        }
    }

    /// 从服务端状态字符串解析，未知取值返回 None
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStage::Pending),
            "uploading" => Some(FileStage::Uploading),
            "optimizing" => Some(FileStage::Optimizing),
            "previewing" => Some(FileStage::Previewing),
            "complete" => Some(FileStage::Complete),
            "failed" => Some(FileStage::Failed),
            "cancelled" => Some(FileStage::Cancelled),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStage::Complete | FileStage::Failed | FileStage::Cancelled
        )
    }

    /// 推进序号：遥测合并只允许阶段向前走，旧事件不能把阶段拉回去
    pub fn rank(&self) -> u8 {
        match self {
            FileStage::Pending => 0,
            FileStage::Uploading => 1,
            FileStage::Optimizing => 2,
            FileStage::Previewing => 3,
            FileStage::Complete => 4,
            // 终态错误不参与向前推进比较
            FileStage::Failed | FileStage::Cancelled => 5,
        }
    }
}

/// 单个文件的传输记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    /// 本地任务ID（日志追踪用，与服务端无关）
    pub id: String,
    /// 本地源文件路径（只读）
    pub source_path: PathBuf,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// MIME 类型
    pub mime_type: String,
    /// 服务端下发的文件ID，初始化成功前为空
    #[serde(default)]
    pub file_id: String,
    /// 服务端下发的分片大小
    #[serde(default)]
    pub chunk_size: u64,
    /// 总分片数
    #[serde(default)]
    pub total_chunks: usize,
    /// 已确认分片数（分片管理器的镜像计数，供快照/事件使用）
    #[serde(default)]
    pub acked_chunks: usize,
    /// 当前阶段
    pub stage: FileStage,
    /// 预览地址（遥测通道下发）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileTransfer {
    /// 创建文件传输记录
    pub fn new(
        source_path: PathBuf,
        name: String,
        size: u64,
        mime_type: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_path,
            name,
            size,
            mime_type,
            file_id: String::new(),
            chunk_size: 0,
            total_chunks: 0,
            acked_chunks: 0,
            stage: FileStage::Pending,
            preview_url: None,
            error: None,
        }
    }

    /// 从本地路径创建（读取文件元数据，按扩展名推断 MIME）
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("读取文件元数据失败: {:?}", path))?;
        if !meta.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mime_type = guess_mime_type(&name).to_string();

        Ok(Self::new(path.to_path_buf(), name, meta.len(), mime_type))
    }

    /// 绑定服务端下发的上传描述符
    pub fn bind_descriptor(&mut self, file_id: String, chunk_size: u64, total_chunks: usize) {
        self.file_id = file_id;
        self.chunk_size = chunk_size;
        self.total_chunks = total_chunks;
    }

    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.acked_chunks as f64 / self.total_chunks as f64) * 100.0
    }

    /// 所有分片是否已确认
    ///
    /// 这是进入 complete 的必要条件，非充分条件（还需要服务端的最终确认）。
    pub fn all_chunks_acked(&self) -> bool {
        self.total_chunks > 0 && self.acked_chunks >= self.total_chunks
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        if self.stage == FileStage::Pending {
            self.stage = FileStage::Uploading;
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.stage = FileStage::Complete;
        self.acked_chunks = self.total_chunks;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.stage = FileStage::Failed;
        self.error = Some(error);
    }

    /// 标记为已取消（终态不再覆盖）
    pub fn mark_cancelled(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = FileStage::Cancelled;
        }
    }

    /// 遥测合并：只向前推进阶段，返回是否发生了变化
    ///
    /// 乱序/重复的遥测事件对阶段是空操作；failed/cancelled
    /// 只能由本地错误路径设置，不接受遥测覆盖。
    pub fn advance_stage(&mut self, stage: FileStage) -> bool {
        if self.stage.is_terminal() {
            return false;
        }
        if matches!(stage, FileStage::Failed | FileStage::Cancelled) {
            return false;
        }
        if stage.rank() > self.stage.rank() {
            self.stage = stage;
            return true;
        }
        false
    }
}

/// 按扩展名推断 MIME 类型，未知扩展名回退 application/octet-stream
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> FileTransfer {
        FileTransfer::new(
            PathBuf::from("./photos/cat.jpg"),
            "cat.jpg".to_string(),
            1024,
            "image/jpeg".to_string(),
        )
    }

    #[test]
    fn test_new_defaults() {
        let file = sample();
        assert_eq!(file.stage, FileStage::Pending);
        assert!(file.file_id.is_empty());
        assert_eq!(file.progress(), 0.0);
        assert!(!file.all_chunks_acked());
    }

    #[test]
    fn test_bind_descriptor_and_progress() {
        let mut file = sample();
        file.bind_descriptor("f-1".to_string(), 256, 4);

        file.acked_chunks = 1;
        assert_eq!(file.progress(), 25.0);

        file.acked_chunks = 4;
        assert_eq!(file.progress(), 100.0);
        assert!(file.all_chunks_acked());
    }

    #[test]
    fn test_stage_transitions() {
        let mut file = sample();

        file.mark_uploading();
        assert_eq!(file.stage, FileStage::Uploading);

        file.mark_failed("网络错误".to_string());
        assert_eq!(file.stage, FileStage::Failed);
        assert_eq!(file.error.as_deref(), Some("网络错误"));

        // 终态不被取消覆盖
        file.mark_cancelled();
        assert_eq!(file.stage, FileStage::Failed);
    }

    #[test]
    fn test_advance_stage_forward_only() {
        let mut file = sample();
        file.mark_uploading();

        assert!(file.advance_stage(FileStage::Optimizing));
        assert_eq!(file.stage, FileStage::Optimizing);

        // 旧事件不能回退阶段
        assert!(!file.advance_stage(FileStage::Uploading));
        assert_eq!(file.stage, FileStage::Optimizing);

        // 重复事件是空操作
        assert!(!file.advance_stage(FileStage::Optimizing));

        assert!(file.advance_stage(FileStage::Previewing));
        assert!(file.advance_stage(FileStage::Complete));
        assert!(file.stage.is_terminal());

        // 终态后不再接受任何推进
        assert!(!file.advance_stage(FileStage::Complete));
    }

    #[test]
    fn test_advance_stage_rejects_remote_failure() {
        let mut file = sample();
        file.mark_uploading();

        // failed/cancelled 只能由本地错误路径设置
        assert!(!file.advance_stage(FileStage::Failed));
        assert_eq!(file.stage, FileStage::Uploading);
    }

    #[test]
    fn test_stage_serde_lowercase() {
        let json = serde_json::to_string(&FileStage::Optimizing).unwrap();
        assert_eq!(json, "\"optimizing\"");

        let parsed: FileStage = serde_json::from_str("\"previewing\"").unwrap();
        assert_eq!(parsed, FileStage::Previewing);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!(FileStage::parse("uploading"), Some(FileStage::Uploading));
        assert_eq!(FileStage::parse("瞎写的"), None);
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("a.PDF"), "application/pdf");
        assert_eq!(guess_mime_type("b.tar.gz"), "application/octet-stream");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_from_path() {
        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .unwrap();
        tmp.write_all(&[0u8; 512]).unwrap();
        tmp.flush().unwrap();

        let file = FileTransfer::from_path(tmp.path()).await.unwrap();
        assert_eq!(file.size, 512);
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.stage, FileStage::Pending);
    }
}
