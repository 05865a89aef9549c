// 遥测通道
//
// 推送优先、轮询兜底：
// - 会话启动时尝试建立 WebSocket 订阅，限时未建立即降级
// - 推送通道中途断开同样降级
// - 降级是单向且对本会话永久的：不回头重连推送，避免来回抖动
// - 两条路径产出同样的 NotificationEvent，下游合并按最大进度幂等处理，
//   乱序与重复投递都不会造成进度回退

use crate::config::TelemetryConfig;
use crate::ingest::IngestApi;
use crate::telemetry::events::NotificationEvent;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 遥测通道错误
///
/// 通道出错从不影响传输本身，只触发降级。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("推送通道连接失败: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("推送通道建立超时 ({0}ms)")]
    ConnectTimeout(u64),

    #[error("推送通道已关闭")]
    Closed,
}

/// 通道状态
///
/// 显式暴露给调用方（watch 订阅），测试可以确定性地驱动两条路径。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 正在尝试建立推送通道
    Connecting,
    /// 推送通道健康，不轮询
    Connected,
    /// 已降级为轮询（对本会话永久）
    Degraded,
    /// 已停止（会话终态或取消）
    Stopped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Degraded => "degraded",
            ChannelState::Stopped => "stopped",
        }
    }
}

/// 推送阶段的收场方式
enum PushOutcome {
    /// 会话结束 / 取消，整个通道收口
    Finished,
    /// 推送不可用，进入轮询
    Degrade,
}

/// 遥测通道句柄
///
/// 状态通过 watch 订阅，事件流通过 mpsc 消费。
pub struct TelemetryHandle {
    state_rx: watch::Receiver<ChannelState>,
    events_rx: mpsc::UnboundedReceiver<NotificationEvent>,
}

impl TelemetryHandle {
    /// 订阅通道状态
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// 取走事件流
    pub fn into_events(self) -> mpsc::UnboundedReceiver<NotificationEvent> {
        self.events_rx
    }
}

/// 遥测通道
pub struct TelemetryChannel;

impl TelemetryChannel {
    /// 启动会话级遥测通道
    ///
    /// # 参数
    /// * `api` - 接入服务客户端（轮询路径使用）
    /// * `session_id` - 会话ID
    /// * `websocket_url` - 推送地址；None 直接走轮询
    /// * `config` - 遥测配置
    /// * `cancel` - 会话取消令牌（会话终态时由编排器收口）
    pub fn spawn(
        api: Arc<dyn IngestApi>,
        session_id: String,
        websocket_url: Option<String>,
        config: TelemetryConfig,
        cancel: CancellationToken,
    ) -> TelemetryHandle {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (event_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_channel(
            api,
            session_id,
            websocket_url,
            config,
            cancel,
            state_tx,
            event_tx,
        ));

        TelemetryHandle {
            state_rx,
            events_rx,
        }
    }
}

/// 通道主流程：推送 → （必要时）降级轮询
async fn run_channel(
    api: Arc<dyn IngestApi>,
    session_id: String,
    websocket_url: Option<String>,
    config: TelemetryConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<ChannelState>,
    event_tx: mpsc::UnboundedSender<NotificationEvent>,
) {
    if let Some(url) = websocket_url {
        match run_push(
            &url,
            &session_id,
            config.connect_timeout_ms,
            &cancel,
            &state_tx,
            &event_tx,
        )
        .await
        {
            PushOutcome::Finished => {
                let _ = state_tx.send(ChannelState::Stopped);
                return;
            }
            PushOutcome::Degrade => {}
        }
    } else {
        debug!("服务端未下发推送地址，遥测直接走轮询");
    }

    if cancel.is_cancelled() {
        let _ = state_tx.send(ChannelState::Stopped);
        return;
    }

    let _ = state_tx.send(ChannelState::Degraded);
    warn!(
        "会话 {} 遥测降级为轮询, 间隔 {}ms",
        session_id, config.poll_interval_ms
    );

    run_poll(
        api,
        &session_id,
        Duration::from_millis(config.poll_interval_ms.max(1)),
        &cancel,
        &event_tx,
    )
    .await;

    let _ = state_tx.send(ChannelState::Stopped);
}

/// 推送路径：限时建连 + 读循环
async fn run_push(
    url: &str,
    session_id: &str,
    connect_timeout_ms: u64,
    cancel: &CancellationToken,
    state_tx: &watch::Sender<ChannelState>,
    event_tx: &mpsc::UnboundedSender<NotificationEvent>,
) -> PushOutcome {
    let connect = tokio_tungstenite::connect_async(url);
    let ws_stream = tokio::select! {
        _ = cancel.cancelled() => return PushOutcome::Finished,
        connected = tokio::time::timeout(Duration::from_millis(connect_timeout_ms), connect) => {
            match connected {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    warn!("遥测推送连接失败: {}", TelemetryError::Connect(e));
                    return PushOutcome::Degrade;
                }
                Err(_) => {
                    warn!("{}", TelemetryError::ConnectTimeout(connect_timeout_ms));
                    return PushOutcome::Degrade;
                }
            }
        }
    };

    let _ = state_tx.send(ChannelState::Connected);
    info!("遥测推送通道已建立: session_id={}", session_id);

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("遥测推送通道随会话收口");
                return PushOutcome::Finished;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<NotificationEvent>(&text) {
                        Ok(event) if event.belongs_to(session_id) => {
                            if event_tx.send(event).is_err() {
                                // 下游不再消费，通道没有存在的意义了
                                return PushOutcome::Finished;
                            }
                        }
                        Ok(event) => {
                            debug!("忽略其它会话的遥测事件: {}", event.session_id);
                        }
                        Err(e) => {
                            warn!("遥测事件解析失败，丢弃该帧: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    warn!("遥测推送通道被服务端关闭: {}", TelemetryError::Closed);
                    return PushOutcome::Degrade;
                }
                Some(Err(e)) => {
                    warn!("遥测推送通道出错: {}", e);
                    return PushOutcome::Degrade;
                }
                None => {
                    warn!("遥测推送流结束: {}", TelemetryError::Closed);
                    return PushOutcome::Degrade;
                }
            }
        }
    }
}

/// 轮询路径：固定间隔拉取会话状态，直到会话收口
///
/// 单次轮询失败不致命，下个周期继续。
async fn run_poll(
    api: Arc<dyn IngestApi>,
    session_id: &str,
    interval: Duration,
    cancel: &CancellationToken,
    event_tx: &mpsc::UnboundedSender<NotificationEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("会话 {} 遥测轮询停止", session_id);
                return;
            }
            _ = ticker.tick() => {
                match api.session_status(session_id).await {
                    Ok(status) if status.errno == 0 => {
                        for entry in &status.files {
                            let event = NotificationEvent::from_status_entry(session_id, entry);
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(status) => {
                        warn!(
                            "会话状态轮询被拒绝: errno={}, errmsg={}",
                            status.errno, status.errmsg
                        );
                    }
                    Err(e) => {
                        warn!("会话状态轮询失败: {}", e);
                    }
                }
            }
        }
    }
}
