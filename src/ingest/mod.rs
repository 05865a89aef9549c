// 接入服务模块
//
// 编排器是纯客户端：分片如何落盘、合并、计费都是服务端的事，
// 这里只定义它对外暴露的调用契约和对应的 HTTP 实现。

pub mod client;
pub mod types;

pub use client::{IngestApi, IngestClient};
pub use types::{
    classify_chunk_error, ChunkAck, ChunkErrorKind, CompleteResponse, FileDescriptor,
    FileManifestEntry, FileStatusEntry, InitializeRequest, InitializeResponse, SessionMetadata,
    SessionStatusResponse,
};
