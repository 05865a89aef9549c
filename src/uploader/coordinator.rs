// 会话编排器
//
// 一次多文件上传会话的总控：
// 1. initialize: 上报清单换取会话ID与各文件描述符
// 2. start: 每文件一个分片调度器，跨文件并发受限且全会话统一；
//    分片确认与遥测事件都汇入同一进度聚合器
// 3. complete: 所有文件分片确认后发起一次 finalize，失败可安全重发
// 4. cancel: 单一协作取消信号，已确认分片不回收
//
// 普通分片传输与遥测增强共用这一套状态机，遥测只是可选策略，
// 不再维护两份几乎相同的编排逻辑。

use crate::config::UploadConfig;
use crate::events::{ProgressThrottler, SessionEvent};
use crate::ingest::{FileManifestEntry, IngestApi, SessionMetadata};
use crate::telemetry::{ChannelState, NotificationEvent, TelemetryChannel};
use crate::uploader::cancel::CancelController;
use crate::uploader::chunk::ChunkManager;
use crate::uploader::file::FileTransfer;
use crate::uploader::progress::{ProgressAggregator, ProgressSnapshot};
use crate::uploader::scheduler::{ChunkAckFn, ChunkAckNotice, ChunkScheduler};
use crate::uploader::session::{
    PublishedResource, SessionState, TransferSession, UploadError,
};
use anyhow::Result;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 进度回调: (百分比, 文件索引)
pub type ProgressCallback = Box<dyn Fn(f64, usize) + Send + Sync>;
/// 文件完成回调: (文件索引, 文件ID)
pub type FileCompleteCallback = Box<dyn Fn(usize, &str) + Send + Sync>;
/// 错误回调: (错误信息, 文件索引；会话级错误无索引)
pub type ErrorCallback = Box<dyn Fn(&str, Option<usize>) + Send + Sync>;

/// 调用方回调集合
#[derive(Default)]
pub struct UploadCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_file_complete: Option<FileCompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

/// 会话编排器
pub struct SessionCoordinator {
    /// 接入服务客户端
    api: Arc<dyn IngestApi>,
    /// 配置
    config: UploadConfig,
    /// 会话值对象
    session: Arc<SyncMutex<TransferSession>>,
    /// 每文件分片管理器（与 session.files 同序）
    managers: SyncMutex<Vec<Arc<Mutex<ChunkManager>>>>,
    /// 进度聚合器
    aggregator: Arc<ProgressAggregator>,
    /// 取消控制器
    cancel: CancelController,
    /// 调用方回调
    callbacks: Arc<UploadCallbacks>,
    /// 事件订阅通道
    events_tx: SyncMutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    /// 进度事件节流器
    throttler: Arc<ProgressThrottler>,
    /// 遥测通道状态（启用后可观测）
    telemetry_state: SyncMutex<Option<watch::Receiver<ChannelState>>>,
    /// 遥测收口令牌
    telemetry_cancel: SyncMutex<Option<CancellationToken>>,
}

impl SessionCoordinator {
    pub fn new(api: Arc<dyn IngestApi>, config: UploadConfig) -> Self {
        let throttle_ms = config.transfer.progress_throttle_ms;
        Self {
            api,
            config,
            session: Arc::new(SyncMutex::new(TransferSession::empty())),
            managers: SyncMutex::new(Vec::new()),
            aggregator: Arc::new(ProgressAggregator::new()),
            cancel: CancelController::new(),
            callbacks: Arc::new(UploadCallbacks::default()),
            events_tx: SyncMutex::new(None),
            throttler: Arc::new(ProgressThrottler::with_millis(throttle_ms)),
            telemetry_state: SyncMutex::new(None),
            telemetry_cancel: SyncMutex::new(None),
        }
    }

    /// 设置调用方回调（须在 initialize 之前）
    pub fn with_callbacks(mut self, callbacks: UploadCallbacks) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// 订阅会话事件（须在 start 之前调用）
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock() = Some(tx);
        rx
    }

    /// 当前会话状态
    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    /// 会话ID（初始化成功前为空）
    pub fn session_id(&self) -> String {
        self.session.lock().session_id.clone()
    }

    /// 整体进度（字节加权百分比）
    pub fn overall_progress(&self) -> f64 {
        self.aggregator.overall_percent()
    }

    /// 进度快照
    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.aggregator.snapshot()
    }

    /// 遥测通道状态订阅（未启用时为 None）
    pub fn telemetry_state(&self) -> Option<watch::Receiver<ChannelState>> {
        self.telemetry_state.lock().clone()
    }

    /// 初始化会话
    ///
    /// 上报文件清单与元数据。这里失败对本次尝试是致命的：
    /// 没有半建立的会话需要清理，调用方重开新会话即可。
    pub async fn initialize(
        &self,
        files: Vec<FileTransfer>,
        metadata: SessionMetadata,
    ) -> Result<String> {
        if files.is_empty() {
            return Err(UploadError::InitializeFailed("文件清单为空".to_string()).into());
        }

        let manifest: Vec<FileManifestEntry> = files
            .iter()
            .map(|f| FileManifestEntry {
                name: f.name.clone(),
                size: f.size,
                mime_type: f.mime_type.clone(),
            })
            .collect();

        let client_ref = {
            let mut session = self.session.lock();
            session.transition(SessionState::Initializing)?;
            session.files = files;
            session.metadata = metadata.clone();
            session.client_ref.clone()
        };

        info!(
            "初始化上传会话: client_ref={}, {} 个文件, title={}",
            client_ref,
            manifest.len(),
            metadata.title
        );

        match self.api.initialize_session(&manifest, &metadata).await {
            Ok(response) => {
                let session_id = response.session_id.clone();
                let bind_result = {
                    let mut session = self.session.lock();
                    session
                        .bind_initialize_response(&response)
                        .and_then(|_| session.transition(SessionState::Active))
                };
                if let Err(e) = bind_result {
                    let mut session = self.session.lock();
                    let _ = session.transition(SessionState::Failed);
                    drop(session);
                    let message = e.to_string();
                    error!("{}", message);
                    self.fire_error(&message, None);
                    return Err(e.into());
                }

                // 按服务端描述符建立分片管理器并登记进度权重
                let mut managers = Vec::new();
                {
                    let session = self.session.lock();
                    for file in &session.files {
                        self.aggregator.register_file(&file.file_id, file.size);
                        managers.push(Arc::new(Mutex::new(ChunkManager::from_descriptor(
                            file.size,
                            file.chunk_size,
                        ))));
                    }
                }
                *self.managers.lock() = managers;

                let file_count = self.session.lock().files.len();
                self.emit(SessionEvent::Initialized {
                    session_id: session_id.clone(),
                    file_count,
                });

                info!("会话初始化完成: session_id={}", session_id);
                Ok(session_id)
            }
            Err(e) => {
                {
                    let mut session = self.session.lock();
                    let _ = session.transition(SessionState::Failed);
                }
                let message = format!("会话初始化失败: {}", e);
                error!("{}", message);
                self.fire_error(&message, None);
                Err(UploadError::InitializeFailed(e.to_string()).into())
            }
        }
    }

    /// 启动传输并驱动到发布
    ///
    /// 跨文件并发调度（上限可配，会话内统一策略）。
    /// 单个文件永久失败不会中止兄弟文件（部分失败隔离），
    /// 但会话最终以失败收场且不发起 finalize。
    pub async fn start(&self) -> Result<PublishedResource> {
        let (session_id, websocket_url, file_count) = {
            let session = self.session.lock();
            if session.state != SessionState::Active {
                return Err(UploadError::InvalidTransition {
                    from: session.state,
                    to: SessionState::Completing,
                }
                .into());
            }
            (
                session.session_id.clone(),
                session.websocket_url.clone(),
                session.files.len(),
            )
        };

        self.aggregator.mark_started();

        // 可选遥测策略
        if self.config.telemetry.enabled {
            self.spawn_telemetry(&session_id, websocket_url);
        }

        info!(
            "开始传输: session_id={}, 文件数={}, 跨文件并发={}, 单文件分片并发={}",
            session_id,
            file_count,
            self.config.transfer.max_concurrent_files,
            self.config.transfer.max_concurrent_chunks
        );

        let file_semaphore = Arc::new(Semaphore::new(
            self.config.transfer.max_concurrent_files.max(1),
        ));
        let mut join_set: JoinSet<(usize, Result<()>)> = JoinSet::new();

        for file_index in 0..file_count {
            let (file_id, source_path) = {
                let session = self.session.lock();
                let file = &session.files[file_index];
                (file.file_id.clone(), file.source_path.clone())
            };
            let manager = self.managers.lock()[file_index].clone();

            let scheduler = ChunkScheduler::new(
                self.api.clone(),
                session_id.clone(),
                file_id,
                source_path,
                manager,
                self.cancel.token(),
                self.config.retry.clone(),
                self.config.transfer.max_concurrent_chunks,
                self.make_ack_fn(file_index),
            );

            let semaphore = file_semaphore.clone();
            let session = self.session.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (file_index, Err(anyhow::anyhow!("并发信号量已关闭"))),
                };
                {
                    session.lock().files[file_index].mark_uploading();
                }
                (file_index, scheduler.run().await)
            });
        }

        // 收割所有文件的结果：失败互相隔离
        let mut failed_files: Vec<usize> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((file_index, Ok(()))) => self.on_file_fully_acked(file_index),
                Ok((file_index, Err(e))) => {
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    let message = e.to_string();
                    {
                        let mut session = self.session.lock();
                        session.files[file_index].mark_failed(message.clone());
                    }
                    let file_id = self.session.lock().files[file_index].file_id.clone();
                    error!("文件 {} 传输失败: {}", file_id, message);
                    self.fire_error(&message, Some(file_index));
                    self.emit(SessionEvent::FileFailed {
                        file_id,
                        file_index,
                        error: message,
                    });
                    failed_files.push(file_index);
                }
                Err(e) => {
                    if e.is_cancelled() || self.cancel.is_cancelled() {
                        continue;
                    }
                    error!("文件调度任务异常: {}", e);
                    failed_files.push(usize::MAX);
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.finish_cancelled();
            return Err(UploadError::Cancelled.into());
        }

        if !failed_files.is_empty() {
            let message = format!("{} 个文件传输失败，会话不再发布", failed_files.len());
            {
                let mut session = self.session.lock();
                let _ = session.transition(SessionState::Failed);
            }
            self.stop_telemetry();
            self.emit(SessionEvent::Failed {
                session_id,
                error: message.clone(),
            });
            return Err(anyhow::anyhow!("{}", message));
        }

        // 所有文件分片确认完成 → 发起 finalize
        self.complete().await
    }

    /// 完成会话
    ///
    /// 前置条件：每个文件的分片都已全部确认，否则拒绝。
    /// finalize 失败时会话停留在 completing，可重复调用本方法
    /// 重发（服务端幂等），绝不会重传分片。
    pub async fn complete(&self) -> Result<PublishedResource> {
        let session_id = {
            let session = self.session.lock();
            match session.state {
                SessionState::Active | SessionState::Completing => {}
                other => {
                    return Err(UploadError::InvalidTransition {
                        from: other,
                        to: SessionState::Completing,
                    }
                    .into());
                }
            }
            session.session_id.clone()
        };

        // 完成前置条件检查
        let pending_files = {
            let managers = self.managers.lock().clone();
            let mut pending = 0usize;
            for manager in managers {
                if !manager.lock().await.is_complete() {
                    pending += 1;
                }
            }
            pending
        };
        if pending_files > 0 {
            warn!(
                "完成调用被拒绝: 还有 {} 个文件分片未全部确认",
                pending_files
            );
            return Err(UploadError::PreconditionNotMet { pending_files }.into());
        }

        {
            let mut session = self.session.lock();
            if session.state == SessionState::Active {
                session.transition(SessionState::Completing)?;
            }
        }

        info!("所有文件分片确认完成，发起会话 finalize: {}", session_id);

        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..=self.config.retry.max_retries {
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                return Err(UploadError::Cancelled.into());
            }

            match self.api.complete_session(&session_id).await {
                Ok(response) => {
                    {
                        let mut session = self.session.lock();
                        session.transition(SessionState::Completed)?;
                        for file in &mut session.files {
                            file.mark_completed();
                        }
                    }
                    self.stop_telemetry();

                    let published = PublishedResource {
                        url: response.url,
                        slug: response.slug,
                    };
                    info!(
                        "🚀 会话发布成功: url={}, slug={}",
                        published.url, published.slug
                    );
                    self.emit(SessionEvent::Completed {
                        session_id,
                        url: published.url.clone(),
                        slug: published.slug.clone(),
                    });
                    return Ok(published);
                }
                Err(e) => {
                    if attempt < self.config.retry.max_retries {
                        let kind = crate::ingest::classify_chunk_error(&e);
                        let backoff_ms = self.config.retry.backoff_ms(attempt, &kind);
                        warn!(
                            "finalize 失败，{}ms 后重发 ({}/{}): {}",
                            backoff_ms,
                            attempt + 1,
                            self.config.retry.max_retries,
                            e
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        // 停留在 completing，调用方可再次 complete() 重试
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "finalize 失败".to_string());
        error!("会话 finalize 重试耗尽: {}", message);
        self.fire_error(&message, None);
        Err(UploadError::CompleteFailed(message).into())
    }

    /// 取消上传
    ///
    /// 触发协作取消信号；在途分片请求中止，服务端已确认的分片
    /// 不回收（清理是服务端的事）。
    pub fn cancel(&self) {
        info!("用户发起取消");
        self.cancel.cancel();
        self.finish_cancelled();
    }

    /// 取消收尾：标记会话与文件终态并收口遥测（幂等）
    fn finish_cancelled(&self) {
        self.stop_telemetry();
        let (session_id, newly_cancelled) = {
            let mut session = self.session.lock();
            let newly_cancelled = session.state.can_transition_to(SessionState::Cancelled);
            if newly_cancelled {
                let _ = session.transition(SessionState::Cancelled);
            }
            for file in &mut session.files {
                file.mark_cancelled();
            }
            (session.session_id.clone(), newly_cancelled)
        };
        if newly_cancelled {
            self.emit(SessionEvent::Cancelled { session_id });
        }
    }

    /// 单文件全部分片确认后的处理
    fn on_file_fully_acked(&self, file_index: usize) {
        let (file_id, telemetry_active) = {
            let mut session = self.session.lock();
            let telemetry_active = self.config.telemetry.enabled;
            let file = &mut session.files[file_index];
            file.acked_chunks = file.total_chunks;
            if !telemetry_active {
                // 普通分片传输：uploading 直接进入 complete
                file.mark_completed();
            }
            (file.file_id.clone(), telemetry_active)
        };

        self.aggregator.merge_file_progress(&file_id, 100.0);

        debug!(
            "文件 {} 分片全部确认 (telemetry={})",
            file_id, telemetry_active
        );

        if let Some(cb) = &self.callbacks.on_file_complete {
            cb(file_index, &file_id);
        }
        self.emit(SessionEvent::FileCompleted {
            file_id,
            file_index,
        });
    }

    /// 构造分片确认回调：聚合进度、镜像计数、节流发布
    fn make_ack_fn(&self, file_index: usize) -> ChunkAckFn {
        let aggregator = self.aggregator.clone();
        let session = self.session.clone();
        let callbacks = self.callbacks.clone();
        let throttler = self.throttler.clone();
        let events_tx = self.events_tx.lock().clone();

        Arc::new(move |notice: ChunkAckNotice| {
            let percent = notice.percent();
            let merged = aggregator.merge_file_progress(&notice.file_id, percent);

            {
                let mut session = session.lock();
                if let Some(file) = session.files.get_mut(file_index) {
                    // 镜像计数只增不减
                    file.acked_chunks = file.acked_chunks.max(notice.acked_chunks);
                }
            }

            // 低优先级进度事件节流；收尾的 100% 必达
            if throttler.should_emit() || percent >= 100.0 {
                if let Some(cb) = &callbacks.on_progress {
                    cb(merged, file_index);
                }
                if let Some(tx) = &events_tx {
                    let _ = tx.send(SessionEvent::FileProgress {
                        file_id: notice.file_id.clone(),
                        file_index,
                        progress: merged,
                        acked_chunks: notice.acked_chunks,
                        total_chunks: notice.total_chunks,
                    });
                    let _ = tx.send(SessionEvent::OverallProgress {
                        progress: aggregator.overall_percent(),
                        estimated_seconds_remaining: aggregator.eta_seconds(),
                    });
                }
            }
        })
    }

    /// 启动遥测通道与合并任务
    fn spawn_telemetry(&self, session_id: &str, websocket_url: Option<String>) {
        let token = self.cancel.child_token();
        *self.telemetry_cancel.lock() = Some(token.clone());

        let handle = TelemetryChannel::spawn(
            self.api.clone(),
            session_id.to_string(),
            websocket_url,
            self.config.telemetry.clone(),
            token,
        );
        *self.telemetry_state.lock() = Some(handle.state());

        let session = self.session.clone();
        let aggregator = self.aggregator.clone();
        let callbacks = self.callbacks.clone();
        let throttler = self.throttler.clone();
        let events_tx = self.events_tx.lock().clone();
        let mut events = handle.into_events();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply_notification(
                    &session,
                    &aggregator,
                    &callbacks,
                    &events_tx,
                    &throttler,
                    event,
                );
            }
            debug!("遥测事件流结束");
        });
    }

    /// 收口遥测（会话终态时调用；未启用时是空操作）
    fn stop_telemetry(&self) {
        if let Some(token) = self.telemetry_cancel.lock().take() {
            token.cancel();
        }
    }

    /// 发布会话事件
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// 触发错误回调
    fn fire_error(&self, message: &str, file_index: Option<usize>) {
        if let Some(cb) = &self.callbacks.on_error {
            cb(message, file_index);
        }
    }
}

/// 把一条遥测通知合并进会话模型
///
/// 两条更新路径（分片确认 / 遥测）在这里汇合：
/// 进度取最大值幂等合并，阶段只向前推进，重复与乱序投递都是空操作。
pub(crate) fn apply_notification(
    session: &Arc<SyncMutex<TransferSession>>,
    aggregator: &Arc<ProgressAggregator>,
    callbacks: &Arc<UploadCallbacks>,
    events_tx: &Option<mpsc::UnboundedSender<SessionEvent>>,
    throttler: &Arc<ProgressThrottler>,
    event: NotificationEvent,
) {
    let merged = aggregator.merge_file_progress(&event.file_id, event.progress);

    // 锁内只改状态，回调与事件发布都放到锁外
    let (file_index, stage_change) = {
        let mut session = session.lock();
        let Some(file_index) = session.file_index_by_id(&event.file_id) else {
            debug!("遥测事件指向未知文件，忽略: {}", event.file_id);
            return;
        };

        let file = &mut session.files[file_index];
        if event.preview_url.is_some() {
            file.preview_url = event.preview_url.clone();
        }

        let stage_change = match event.parsed_stage() {
            Some(stage) => {
                let old_stage = file.stage;
                if file.advance_stage(stage) {
                    Some((old_stage, file.stage))
                } else {
                    None
                }
            }
            None => {
                debug!("未知遥测阶段 {:?}，忽略阶段推进", event.stage);
                None
            }
        };

        (file_index, stage_change)
    };

    if let Some((old_stage, new_stage)) = stage_change {
        info!(
            "文件 {} 阶段推进: {} -> {}",
            event.file_id,
            old_stage.as_str(),
            new_stage.as_str()
        );
        if let Some(tx) = events_tx {
            let _ = tx.send(SessionEvent::FileStageChanged {
                file_id: event.file_id.clone(),
                old_stage: old_stage.as_str().to_string(),
                new_stage: new_stage.as_str().to_string(),
            });
        }
    }

    if throttler.should_emit() {
        if let Some(cb) = &callbacks.on_progress {
            cb(merged, file_index);
        }
        if let Some(tx) = events_tx {
            let _ = tx.send(SessionEvent::OverallProgress {
                progress: aggregator.overall_percent(),
                estimated_seconds_remaining: aggregator.eta_seconds(),
            });
        }
    }
}
