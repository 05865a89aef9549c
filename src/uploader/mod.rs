// 上传编排模块
//
// 核心流水线：
// - chunk: 纯函数分片规划 + 确认位图
// - scheduler: 单文件有界并发分片调度（Semaphore + JoinSet）
// - progress: 字节加权进度聚合（幂等最大值合并）
// - session / coordinator: 会话状态机与总控
// - cancel: 会话级协作取消

pub mod cancel;
pub mod chunk;
pub mod coordinator;
pub mod file;
pub mod progress;
pub mod scheduler;
pub mod session;

pub use cancel::CancelController;
pub use chunk::{
    chunk_count, derive_chunk_range, plan, Chunk, ChunkManager, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use coordinator::{
    ErrorCallback, FileCompleteCallback, ProgressCallback, SessionCoordinator, UploadCallbacks,
};
pub use file::{guess_mime_type, FileStage, FileTransfer};
pub use progress::{ProgressAggregator, ProgressSnapshot, PLACEHOLDER_ETA_SECS};
pub use scheduler::{ChunkAckFn, ChunkAckNotice, ChunkScheduler};
pub use session::{PublishedResource, SessionState, TransferSession, UploadError};
