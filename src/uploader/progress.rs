// 进度聚合
//
// 分片确认与遥测事件两条更新路径汇入同一个聚合器。
// 两条路径必须互相幂等：对每个文件只保留见过的最大百分比，
// 迟到的轮询结果不能把更新的推送进度拉回去，反之亦然。

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// 没有任何进度时的保守 ETA 占位值（秒）
pub const PLACEHOLDER_ETA_SECS: u64 = 60;

/// 单文件进度登记
#[derive(Debug, Clone, Copy)]
struct FileEntry {
    /// 文件字节数（加权用）
    bytes: u64,
    /// 见过的最大百分比
    percent: f64,
}

/// 进度快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 每文件百分比 (0-100)
    pub per_file: HashMap<String, f64>,
    /// 整体百分比（按文件字节数加权）
    pub overall: f64,
    /// 预计剩余秒数
    pub estimated_seconds_remaining: u64,
}

/// 进度聚合器
///
/// 整体进度按字节加权而不是按分片数或文件数：
/// 各文件分片大小可能不同（服务端下发），文件大小差异也可能极大，
/// 一个 10 字节文件传完、一个 90 字节文件没动时整体应当报 10% 而不是 50%。
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    /// 每文件进度（file_id → 登记项）
    files: DashMap<String, FileEntry>,
    /// 传输开始时刻（ETA 计算基准）
    started_at: RwLock<Option<Instant>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记文件及其字节权重
    pub fn register_file(&self, file_id: &str, bytes: u64) {
        self.files.insert(
            file_id.to_string(),
            FileEntry {
                bytes,
                percent: 0.0,
            },
        );
    }

    /// 记录传输开始时刻
    pub fn mark_started(&self) {
        let mut started = self.started_at.write();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    /// 合并单文件进度（幂等，取最大值）
    ///
    /// 返回合并后的有效百分比。重复或过期的更新不改变状态，
    /// 因此整体进度随时间单调不减。
    pub fn merge_file_progress(&self, file_id: &str, percent: f64) -> f64 {
        let percent = percent.clamp(0.0, 100.0);
        match self.files.get_mut(file_id) {
            Some(mut entry) => {
                if percent > entry.percent {
                    entry.percent = percent;
                }
                entry.percent
            }
            None => percent,
        }
    }

    /// 单文件当前百分比
    pub fn file_percent(&self, file_id: &str) -> Option<f64> {
        self.files.get(file_id).map(|e| e.percent)
    }

    /// 整体百分比（字节加权）
    ///
    /// 所有文件都是零字节时退化为简单平均，避免除零。
    pub fn overall_percent(&self) -> f64 {
        let mut weighted = 0.0;
        let mut total_bytes = 0u64;
        let mut percent_sum = 0.0;
        let mut count = 0usize;

        for entry in self.files.iter() {
            weighted += entry.bytes as f64 * entry.percent;
            total_bytes += entry.bytes;
            percent_sum += entry.percent;
            count += 1;
        }

        if count == 0 {
            return 0.0;
        }
        if total_bytes == 0 {
            return percent_sum / count as f64;
        }
        weighted / total_bytes as f64
    }

    /// 预计剩余秒数
    ///
    /// 进度为零时返回固定占位值（接近 0% 时这个估计本来就不可靠），
    /// 永远不会返回负数。
    pub fn eta_seconds(&self) -> u64 {
        let elapsed = match *self.started_at.read() {
            Some(t) => t.elapsed().as_secs_f64(),
            None => return PLACEHOLDER_ETA_SECS,
        };
        eta_from(elapsed, self.overall_percent())
    }

    /// 当前进度快照
    pub fn snapshot(&self) -> ProgressSnapshot {
        let per_file = self
            .files
            .iter()
            .map(|e| (e.key().clone(), e.value().percent))
            .collect();

        ProgressSnapshot {
            per_file,
            overall: self.overall_percent(),
            estimated_seconds_remaining: self.eta_seconds(),
        }
    }
}

/// ETA 公式: elapsed / percent * (100 - percent)
pub fn eta_from(elapsed_secs: f64, percent: f64) -> u64 {
    if percent <= 0.0 {
        return PLACEHOLDER_ETA_SECS;
    }
    if percent >= 100.0 {
        return 0;
    }
    let remaining = elapsed_secs / percent * (100.0 - percent);
    remaining.max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_weighted_overall() {
        // 10 字节文件传完、90 字节文件没动 → 整体 10%，不是 50%
        let agg = ProgressAggregator::new();
        agg.register_file("small", 10);
        agg.register_file("big", 90);

        agg.merge_file_progress("small", 100.0);
        assert_eq!(agg.overall_percent(), 10.0);

        agg.merge_file_progress("big", 50.0);
        assert_eq!(agg.overall_percent(), 55.0);
    }

    #[test]
    fn test_merge_keeps_maximum() {
        let agg = ProgressAggregator::new();
        agg.register_file("f", 100);

        assert_eq!(agg.merge_file_progress("f", 40.0), 40.0);
        // 迟到的轮询结果不能回退推送进度
        assert_eq!(agg.merge_file_progress("f", 25.0), 40.0);
        assert_eq!(agg.file_percent("f"), Some(40.0));

        // 重复应用同一事件是空操作
        assert_eq!(agg.merge_file_progress("f", 40.0), 40.0);
    }

    #[test]
    fn test_overall_monotonic_under_interleaving() {
        // 分片确认与遥测事件任意交错，整体进度单调不减
        let agg = ProgressAggregator::new();
        agg.register_file("a", 30);
        agg.register_file("b", 70);

        let updates = [
            ("a", 33.0),
            ("b", 10.0),
            ("a", 20.0), // 过期
            ("b", 40.0),
            ("a", 66.0),
            ("b", 30.0), // 过期
            ("a", 100.0),
            ("b", 100.0),
        ];

        let mut last = 0.0;
        for (file, pct) in updates {
            agg.merge_file_progress(file, pct);
            let overall = agg.overall_percent();
            assert!(
                overall >= last,
                "进度回退: {} -> {}",
                last,
                overall
            );
            last = overall;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_merge_clamps_range() {
        let agg = ProgressAggregator::new();
        agg.register_file("f", 10);

        assert_eq!(agg.merge_file_progress("f", 150.0), 100.0);
        assert_eq!(agg.merge_file_progress("f", -5.0), 100.0);
    }

    #[test]
    fn test_all_zero_byte_files() {
        let agg = ProgressAggregator::new();
        agg.register_file("x", 0);
        agg.register_file("y", 0);

        agg.merge_file_progress("x", 100.0);
        assert_eq!(agg.overall_percent(), 50.0);

        agg.merge_file_progress("y", 100.0);
        assert_eq!(agg.overall_percent(), 100.0);
    }

    #[test]
    fn test_empty_aggregator() {
        let agg = ProgressAggregator::new();
        assert_eq!(agg.overall_percent(), 0.0);
        assert_eq!(agg.eta_seconds(), PLACEHOLDER_ETA_SECS);
    }

    #[test]
    fn test_eta_formula() {
        // 30 秒传了 25% → 还要 90 秒
        assert_eq!(eta_from(30.0, 25.0), 90);
        // 10 秒传了 50% → 还要 10 秒
        assert_eq!(eta_from(10.0, 50.0), 10);
        // 完成后为 0
        assert_eq!(eta_from(100.0, 100.0), 0);
        // 零进度用占位值，不做除零
        assert_eq!(eta_from(5.0, 0.0), PLACEHOLDER_ETA_SECS);
    }

    #[test]
    fn test_snapshot() {
        let agg = ProgressAggregator::new();
        agg.register_file("a", 50);
        agg.register_file("b", 50);
        agg.merge_file_progress("a", 80.0);

        let snap = agg.snapshot();
        assert_eq!(snap.per_file.get("a"), Some(&80.0));
        assert_eq!(snap.per_file.get("b"), Some(&0.0));
        assert_eq!(snap.overall, 40.0);
    }
}
