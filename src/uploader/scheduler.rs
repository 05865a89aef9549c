// 分片调度器
//
// 负责单个文件全部分片的上传：
// - Semaphore 控制最大并发分片数（默认 3，可配置）
// - JoinSet 管理并发任务
// - 指数退避重试（显式策略，按 (file_id, 分片索引) 重传）
// - 分片间不保证确认顺序，完成与否只看索引是否进入确认集合

use crate::config::RetryPolicy;
use crate::ingest::{classify_chunk_error, IngestApi};
use crate::uploader::chunk::{Chunk, ChunkManager};
use crate::uploader::session::UploadError;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片确认通知（调度器 → 编排器）
#[derive(Debug, Clone)]
pub struct ChunkAckNotice {
    /// 文件ID
    pub file_id: String,
    /// 刚确认的分片索引
    pub chunk_index: usize,
    /// 已确认分片数
    pub acked_chunks: usize,
    /// 总分片数
    pub total_chunks: usize,
}

impl ChunkAckNotice {
    /// 该文件当前百分比
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.acked_chunks as f64 / self.total_chunks as f64) * 100.0
    }
}

/// 分片确认回调
pub type ChunkAckFn = Arc<dyn Fn(ChunkAckNotice) + Send + Sync>;

/// 单文件分片调度器
pub struct ChunkScheduler {
    /// 接入服务客户端
    api: Arc<dyn IngestApi>,
    /// 会话ID
    session_id: String,
    /// 文件ID
    file_id: String,
    /// 本地源文件路径
    source_path: PathBuf,
    /// 分片管理器
    chunk_manager: Arc<Mutex<ChunkManager>>,
    /// 取消令牌（会话级共享）
    cancel_token: CancellationToken,
    /// 重试策略
    retry: RetryPolicy,
    /// 最大并发分片数
    max_concurrent: usize,
    /// 分片确认回调
    on_chunk_acked: ChunkAckFn,
}

/// 分片任务上下文（每个并发任务克隆一份）
#[derive(Clone)]
struct ChunkTaskContext {
    api: Arc<dyn IngestApi>,
    session_id: String,
    file_id: String,
    source_path: PathBuf,
    total_chunks: usize,
    chunk_manager: Arc<Mutex<ChunkManager>>,
    cancel_token: CancellationToken,
    retry: RetryPolicy,
    on_chunk_acked: ChunkAckFn,
}

impl ChunkScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn IngestApi>,
        session_id: String,
        file_id: String,
        source_path: PathBuf,
        chunk_manager: Arc<Mutex<ChunkManager>>,
        cancel_token: CancellationToken,
        retry: RetryPolicy,
        max_concurrent: usize,
        on_chunk_acked: ChunkAckFn,
    ) -> Self {
        Self {
            api,
            session_id,
            file_id,
            source_path,
            chunk_manager,
            cancel_token,
            retry,
            max_concurrent: max_concurrent.max(1),
            on_chunk_acked,
        }
    }

    /// 上传该文件的全部分片
    ///
    /// 任一分片耗尽重试后失败即中止本文件并上抛，携带
    /// (file_id, 分片索引) 上下文；同会话的其它文件不受影响。
    pub async fn run(&self) -> Result<()> {
        let (total_chunks, already_acked) = {
            let cm = self.chunk_manager.lock().await;
            (cm.chunk_count(), cm.acked_count())
        };

        info!(
            "开始调度文件 {} 的分片上传: 总数={}, 已确认={}, 并发上限={}",
            self.file_id, total_chunks, already_acked, self.max_concurrent
        );

        let mut join_set: JoinSet<Result<usize>> = JoinSet::new();

        let context = ChunkTaskContext {
            api: self.api.clone(),
            session_id: self.session_id.clone(),
            file_id: self.file_id.clone(),
            source_path: self.source_path.clone(),
            total_chunks,
            chunk_manager: self.chunk_manager.clone(),
            cancel_token: self.cancel_token.clone(),
            retry: self.retry.clone(),
            on_chunk_acked: self.on_chunk_acked.clone(),
        };

        let outcome = self.drive(&mut join_set, context).await;

        if let Err(e) = outcome {
            // 中止在途任务并等它们退出，然后清掉全部在途标记，
            // 保证调用方随后可以按同一索引重新调度失败分片
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            self.chunk_manager.lock().await.release_in_flight_marks();
            return Err(e);
        }

        let acked = self.chunk_manager.lock().await.acked_count();
        if acked != total_chunks {
            anyhow::bail!(
                "文件 {} 调度结束但仍有分片未确认 ({}/{})",
                self.file_id,
                acked,
                total_chunks
            );
        }

        info!(
            "✓ 文件 {} 全部 {} 个分片确认完成",
            self.file_id, total_chunks
        );
        Ok(())
    }

    /// 调度主循环
    async fn drive(
        &self,
        join_set: &mut JoinSet<Result<usize>>,
        context: ChunkTaskContext,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            // 每轮调度前检查取消信号
            if self.cancel_token.is_cancelled() {
                join_set.abort_all();
                return Err(UploadError::Cancelled.into());
            }

            // 取下一个待上传分片并标记，防止重复调度
            let chunk = {
                let mut cm = self.chunk_manager.lock().await;
                match cm.next_pending() {
                    Some(c) => {
                        let chunk = c.clone();
                        cm.mark_uploading(chunk.index);
                        Some(chunk)
                    }
                    None => None,
                }
            };

            let Some(chunk) = chunk else {
                // 没有待调度的分片了，等在途任务收尾
                break;
            };

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    // 并发已满：归还分片，等一个在途任务结束再调度
                    {
                        let mut cm = self.chunk_manager.lock().await;
                        cm.unmark_uploading(chunk.index);
                    }
                    if let Some(result) = join_set.join_next().await {
                        handle_chunk_result(result)?;
                    }
                    continue;
                }
            };

            debug!(
                "调度分片: 文件 {} 分片 #{} (并发 {}/{})",
                self.file_id,
                chunk.index,
                self.max_concurrent - semaphore.available_permits(),
                self.max_concurrent
            );

            let ctx = context.clone();
            let index = chunk.index;
            join_set.spawn(async move {
                let result = upload_chunk_with_retry(ctx, chunk).await;
                drop(permit);
                result.map(|_| index)
            });

            // 非阻塞收割已完成的任务，尽早暴露失败
            while let Some(result) = join_set.try_join_next() {
                handle_chunk_result(result)?;
            }
        }

        // 等待所有在途任务结束
        while let Some(result) = join_set.join_next().await {
            handle_chunk_result(result)?;
        }

        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled.into());
        }

        Ok(())
    }
}

/// 处理单个分片任务的结果
fn handle_chunk_result(
    result: Result<Result<usize>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(index)) => {
            debug!("分片 #{} 任务收割完成", index);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) if e.is_cancelled() => Err(UploadError::Cancelled.into()),
        Err(e) => {
            error!("分片任务异常: {}", e);
            Err(anyhow::anyhow!("分片任务异常: {}", e))
        }
    }
}

/// 带重试的单分片上传
///
/// 分片数据不缓存，每次重试都由同一字节范围重新读取；
/// is_last 按 index == total_chunks - 1 计算并随请求下发。
async fn upload_chunk_with_retry(ctx: ChunkTaskContext, chunk: Chunk) -> Result<()> {
    let is_last = chunk.index + 1 == ctx.total_chunks;
    let mut last_error: Option<anyhow::Error> = None;

    'attempts: for retry in 0..=ctx.retry.max_retries {
        if ctx.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled.into());
        }

        // 每次尝试重新读取分片数据（幂等可重推导）
        let attempt = async {
            let data = chunk.read_data(&ctx.source_path).await?;
            let ack = ctx
                .api
                .upload_chunk(&ctx.session_id, &ctx.file_id, chunk.index, data, is_last)
                .await?;
            if !ack.success {
                anyhow::bail!(
                    "分片被服务端拒绝: {}",
                    ack.error.unwrap_or_else(|| "未知原因".to_string())
                );
            }
            Ok(())
        }
        .await;

        match attempt {
            Ok(()) => {
                let (acked, total) = {
                    let mut cm = ctx.chunk_manager.lock().await;
                    cm.mark_acked(chunk.index);
                    (cm.acked_count(), cm.chunk_count())
                };

                (ctx.on_chunk_acked)(ChunkAckNotice {
                    file_id: ctx.file_id.clone(),
                    chunk_index: chunk.index,
                    acked_chunks: acked,
                    total_chunks: total,
                });

                info!(
                    "✓ 文件 {} 分片 #{} 确认成功 ({}/{}, is_last={})",
                    ctx.file_id, chunk.index, acked, total, is_last
                );
                return Ok(());
            }
            Err(e) => {
                let kind = classify_chunk_error(&e);

                if !kind.is_retriable() {
                    error!(
                        "文件 {} 分片 #{} 上传失败（不可重试）: {:?}, 错误: {}",
                        ctx.file_id, chunk.index, kind, e
                    );
                    last_error = Some(e);
                    break 'attempts;
                }

                if retry < ctx.retry.max_retries {
                    let backoff_ms = ctx.retry.backoff_ms(retry, &kind);
                    warn!(
                        "文件 {} 分片 #{} 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                        ctx.file_id,
                        chunk.index,
                        backoff_ms,
                        retry + 1,
                        ctx.retry.max_retries,
                        e
                    );
                    tokio::select! {
                        _ = ctx.cancel_token.cancelled() => {
                            return Err(UploadError::Cancelled.into());
                        }
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }

                last_error = Some(e);
            }
        }
    }

    // 重试耗尽：记一次重试。在途标记先保留，防止本轮调度重捡该分片，
    // 统一由调度器退出路径清除
    ctx.chunk_manager.lock().await.increment_retry(chunk.index);

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "上传失败".to_string());
    error!(
        "文件 {} 分片 #{} 上传失败，已达最大重试次数 ({})",
        ctx.file_id, chunk.index, ctx.retry.max_retries
    );

    Err(UploadError::ChunkFailed {
        file_id: ctx.file_id.clone(),
        chunk_index: chunk.index,
        message,
    }
    .into())
}
