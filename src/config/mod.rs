// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::ingest::ChunkErrorKind;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 接入服务配置
    pub service: ServiceConfig,
    /// 传输调优
    #[serde(default)]
    pub transfer: TransferTuning,
    /// 重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
    /// 遥测通道配置
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 接入服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 服务基地址
    pub base_url: String,
    /// 单请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 传输调优
///
/// 并发数没有放之四海皆准的常数，单文件并发与跨文件并发
/// 都是可调配置而不是写死的魔法值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTuning {
    /// 客户端建议分片大小（字节，服务端可覆盖）
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 跨文件最大并发数（同一会话内所有文件统一用此策略）
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
}

fn default_chunk_size() -> u64 {
    crate::uploader::chunk::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_chunks() -> usize {
    3
}

fn default_max_concurrent_files() -> usize {
    2
}

fn default_progress_throttle_ms() -> u64 {
    200
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_concurrent_files: default_max_concurrent_files(),
            progress_throttle_ms: default_progress_throttle_ms(),
        }
    }
}

/// 重试策略
///
/// 指数退避 + 有界次数，只作用于被分类为可重试的错误；
/// 重试以 (file_id, 分片索引) 为单位，数据由分片规划重新推导。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数（0 表示失败立即上抛）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 限流时的额外等待时间（毫秒）
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_rate_limit_backoff_ms() -> u64 {
    10000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// 基础退避延迟（确定性部分）
    ///
    /// # 延迟序列（默认配置）
    /// - retry_count=0: 100ms
    /// - retry_count=1: 200ms
    /// - retry_count=2: 400ms
    /// - 上限: 5000ms；限流错误至少等 10000ms
    pub fn base_backoff_ms(&self, retry_count: u32, error_kind: &ChunkErrorKind) -> u64 {
        let base = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        let delay = base.min(self.max_backoff_ms);

        if matches!(error_kind, ChunkErrorKind::RateLimited) {
            delay.max(self.rate_limit_backoff_ms)
        } else {
            delay
        }
    }

    /// 实际退避延迟：基础延迟加最多 25% 的随机抖动，避免并发分片齐步重试
    pub fn backoff_ms(&self, retry_count: u32, error_kind: &ChunkErrorKind) -> u64 {
        use rand::Rng;
        let base = self.base_backoff_ms(retry_count, error_kind);
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        base + jitter
    }
}

/// 遥测通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// 是否启用遥测（关闭时为纯分片传输）
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,
    /// 推送通道建立超时（毫秒），超时即降级轮询
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 降级后的轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_telemetry_enabled() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            connect_timeout_ms: default_connect_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            transfer: TransferTuning::default(),
            retry: RetryPolicy::default(),
            telemetry: TelemetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl UploadConfig {
    /// 从 TOML 文件加载配置，文件不存在时回退默认值
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", path))?;

        config.validate()?;
        info!("配置加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }

    /// 配置合法性检查
    pub fn validate(&self) -> Result<()> {
        if self.service.base_url.is_empty() {
            anyhow::bail!("service.base_url 不能为空");
        }
        if self.transfer.max_concurrent_chunks == 0 {
            anyhow::bail!("transfer.max_concurrent_chunks 必须大于 0");
        }
        if self.transfer.max_concurrent_files == 0 {
            anyhow::bail!("transfer.max_concurrent_files 必须大于 0");
        }
        if self.telemetry.poll_interval_ms == 0 {
            anyhow::bail!("telemetry.poll_interval_ms 必须大于 0");
        }
        Ok(())
    }
}
