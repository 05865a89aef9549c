// Ingest Upload Rust Library
// 接入服务断点续传客户端核心库
//
// 可续传、有界并发的多文件分片上传编排器：
// 本地文件切为定长分片上传到接入服务，聚合分片确认为逐文件与
// 整体进度，驱动 初始化 → 传输 → 完成 的会话生命周期；
// 可选的遥测通道实时推送服务端处理阶段，推送不可用时自动降级轮询。

// 配置管理模块
pub mod config;

// 接入服务客户端模块
pub mod ingest;

// 日志模块
pub mod logging;

// 上传编排模块
pub mod uploader;

// 遥测模块（推送 + 轮询兜底）
pub mod telemetry;

// 会话事件模块
pub mod events;

// 导出常用类型
pub use config::{
    LogConfig, RetryPolicy, ServiceConfig, TelemetryConfig, TransferTuning, UploadConfig,
};
pub use events::{EventPriority, ProgressThrottler, SessionEvent};
pub use ingest::{
    ChunkAck, ChunkErrorKind, FileManifestEntry, IngestApi, IngestClient, SessionMetadata,
};
pub use telemetry::{ChannelState, NotificationEvent, TelemetryChannel, TelemetryError};
pub use uploader::{
    CancelController, ChunkManager, ChunkScheduler, FileStage, FileTransfer, ProgressAggregator,
    ProgressSnapshot, PublishedResource, SessionCoordinator, SessionState, TransferSession,
    UploadCallbacks, UploadError,
};
