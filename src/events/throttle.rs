//! 进度事件节流器
//!
//! 限制低优先级进度事件的发布频率，避免分片确认密集时的事件风暴；
//! 关键事件（完成/失败）绕过节流直接发布

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 无锁实现：时间戳用原子量保存，多个分片任务共享同一个节流器
/// 时也不会互相阻塞。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次放行的单调时钟读数（纳秒）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 以指定间隔创建节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 以毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否放行本次事件
    ///
    /// 距上次放行超过间隔时返回 true 并推进时间戳；
    /// CAS 失败说明别的任务抢先放行了，本次不再发布。
    pub fn should_emit(&self) -> bool {
        let now = Self::monotonic_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange_weak(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（完成/失败等必达事件）
    pub fn force_emit(&self) {
        self.last_emit_nanos
            .store(Self::monotonic_nanos(), Ordering::Relaxed);
    }

    /// 重置节流状态，下一次 should_emit 必然放行
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }

    /// 单调时钟读数（纳秒），不受系统时钟回拨影响
    fn monotonic_nanos() -> u64 {
        thread_local! {
            static EPOCH: Instant = Instant::now();
        }
        EPOCH.with(|epoch| epoch.elapsed().as_nanos() as u64)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
