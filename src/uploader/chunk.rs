// 分片切分
//
// 纯函数式分片规划：同一 (文件大小, 分片大小) 输入永远产生同一分片序列，
// 暂停/恢复的会话可以只靠索引重新推导第 k 个分片，不需要缓存分片数据。
//
// 接入服务分片规则：
// - 分片大小由服务端在会话初始化时下发，客户端默认值仅作请求建议
// - 零字节文件也占一个分片，保证空文件能正常走完会话流程

use anyhow::{Context, Result};
use bit_set::BitSet;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 默认分片大小: 8MB（客户端建议值，服务端可覆盖）
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// 最小分片大小: 256KB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// 最大分片大小: 64MB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// 计算分片数量: ceil(N / C)，零字节文件固定为 1
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if total_size == 0 {
        return 1;
    }
    total_size.div_ceil(chunk_size) as usize
}

/// 推导单个分片的字节范围
///
/// 与 `plan` 保持一致的纯函数，重试时可以只重新推导失败的那一片。
/// 索引越界返回 None。
pub fn derive_chunk_range(total_size: u64, chunk_size: u64, index: usize) -> Option<Range<u64>> {
    if index >= chunk_count(total_size, chunk_size) {
        return None;
    }
    if total_size == 0 {
        return Some(0..0);
    }
    let start = index as u64 * chunk_size;
    let end = std::cmp::min(start + chunk_size, total_size);
    Some(start..end)
}

/// 分片规划：产生覆盖 [0, N) 的连续有序分片序列
///
/// 末片长度为 N mod C（整除时为 C）；N = 0 时产生一个零长分片。
pub fn plan(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    if total_size == 0 {
        return vec![Chunk::new(0, 0..0)];
    }

    let mut chunks = Vec::with_capacity(chunk_count(total_size, chunk_size));
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(Chunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    chunks
}

/// 单个分片
///
/// 分片本身无状态，可由 (文件大小, 分片大小, 索引) 幂等重建，
/// 确认状态由 [`ChunkManager`] 的位图统一维护。
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 分片索引（0 起）
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否正在上传（防止重复调度）
    pub uploading: bool,
    /// 重试次数
    pub retries: u32,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            uploading: false,
            retries: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 从源文件读取分片数据
    ///
    /// 只读访问，不会修改源文件；零长分片返回空缓冲。
    pub async fn read_data(&self, source_path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(source_path)
            .await
            .with_context(|| format!("打开源文件失败: {:?}", source_path))?;

        file.seek(std::io::SeekFrom::Start(self.range.start))
            .await
            .context("源文件定位失败")?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer)
            .await
            .with_context(|| format!("读取分片 #{} 数据失败", self.index))?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 分片管理器
///
/// 持有单个文件的全部分片和确认位图。确认集合只增不减，
/// 重复确认同一索引是空操作。
#[derive(Debug)]
pub struct ChunkManager {
    /// 所有分片
    chunks: Vec<Chunk>,
    /// 已确认分片位图
    acked: BitSet,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl ChunkManager {
    /// 创建分片管理器
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小（限制在 256KB-64MB 范围内；零字节文件不受限制）
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = if total_size == 0 {
            chunk_size.max(1)
        } else {
            chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
        };
        let chunks = plan(total_size, chunk_size);

        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        let capacity = chunks.len();
        Self {
            chunks,
            acked: BitSet::with_capacity(capacity),
            total_size,
            chunk_size,
        }
    }

    /// 按服务端下发的描述符创建分片管理器
    ///
    /// 服务端指定的分片大小优先于客户端默认值，不做范围夹取；
    /// 夹取只作用于客户端自己的建议值。
    pub fn from_descriptor(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = plan(total_size, chunk_size);
        let capacity = chunks.len();

        debug!(
            "按描述符创建分片管理器: 文件大小={} bytes, 服务端分片大小={} bytes, 分片数量={}",
            total_size, chunk_size, capacity
        );

        Self {
            chunks,
            acked: BitSet::with_capacity(capacity),
            total_size,
            chunk_size,
        }
    }

    /// 获取下一个待上传的分片（未确认且未在上传中）
    pub fn next_pending(&mut self) -> Option<&mut Chunk> {
        let acked = &self.acked;
        self.chunks
            .iter_mut()
            .find(|c| !acked.contains(c.index) && !c.uploading)
    }

    /// 所有分片
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 分片大小
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 文件总大小
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 已确认分片数量
    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// 已确认字节数
    pub fn acked_bytes(&self) -> u64 {
        self.acked
            .iter()
            .filter_map(|i| self.chunks.get(i))
            .map(|c| c.size())
            .sum()
    }

    /// 确认分片（幂等）
    ///
    /// 返回 true 表示首次确认，false 表示重复确认（空操作）。
    pub fn mark_acked(&mut self, index: usize) -> bool {
        if index >= self.chunks.len() {
            return false;
        }
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.uploading = false;
        }
        self.acked.insert(index)
    }

    /// 分片是否已确认
    pub fn is_acked(&self, index: usize) -> bool {
        self.acked.contains(index)
    }

    /// 标记分片正在上传（防止重复调度）
    pub fn mark_uploading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.uploading = true;
        }
    }

    /// 取消上传标记（上传失败时调用，让调用方重试能重新调度该片）
    pub fn unmark_uploading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.uploading = false;
        }
    }

    /// 清除所有未确认分片的在途标记
    ///
    /// 调度批次结束（失败或取消）时调用，让后续重传能重新调度这些分片。
    pub fn release_in_flight_marks(&mut self) {
        for chunk in &mut self.chunks {
            chunk.uploading = false;
        }
    }

    /// 增加分片重试次数
    pub fn increment_retry(&mut self, index: usize) -> u32 {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.retries += 1;
            chunk.retries
        } else {
            0
        }
    }

    /// 显式重置所有分片状态
    ///
    /// 确认集合只在这里收缩；正常传输路径上它单调只增。
    pub fn reset(&mut self) {
        self.acked.clear();
        for chunk in &mut self.chunks {
            chunk.uploading = false;
            chunk.retries = 0;
        }
    }

    /// 是否全部确认
    pub fn is_complete(&self) -> bool {
        self.acked.len() == self.chunks.len()
    }

    /// 上传进度百分比
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        (self.acked.len() as f64 / self.chunks.len() as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_plan_exact_multiple() {
        // 整除：末片与其它分片等长
        let chunks = plan(16 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].range, 0..(4 * 1024 * 1024));
        assert_eq!(chunks[3].range, (12 * 1024 * 1024)..(16 * 1024 * 1024));
    }

    #[test]
    fn test_plan_trailing_chunk() {
        // 25MB 文件 / 10MB 分片 → 10MB + 10MB + 5MB
        let mb = 1024 * 1024;
        let chunks = plan(25 * mb, 10 * mb);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size(), 10 * mb);
        assert_eq!(chunks[1].size(), 10 * mb);
        assert_eq!(chunks[2].size(), 5 * mb);
        assert_eq!(chunks[2].range, (20 * mb)..(25 * mb));
    }

    #[test]
    fn test_plan_zero_byte_file() {
        // 零字节文件也要占一个分片，否则空文件永远无法完成会话
        let chunks = plan(0, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range, 0..0);
        assert_eq!(chunks[0].size(), 0);
    }

    #[test]
    fn test_derive_chunk_range_matches_plan() {
        let total = 25 * 1024 * 1024 + 17;
        let size = 4 * 1024 * 1024;
        let chunks = plan(total, size);
        for chunk in &chunks {
            assert_eq!(
                derive_chunk_range(total, size, chunk.index),
                Some(chunk.range.clone())
            );
        }
        // 越界索引
        assert_eq!(derive_chunk_range(total, size, chunks.len()), None);
    }

    #[test]
    fn test_manager_acked_idempotent() {
        let mut manager = ChunkManager::new(16 * 1024 * 1024, 4 * 1024 * 1024);

        assert!(manager.mark_acked(0));
        assert_eq!(manager.acked_count(), 1);

        // 重复确认同一索引，数量不变
        assert!(!manager.mark_acked(0));
        assert_eq!(manager.acked_count(), 1);

        // 越界确认是空操作
        assert!(!manager.mark_acked(99));
        assert_eq!(manager.acked_count(), 1);
    }

    #[test]
    fn test_manager_out_of_order_ack() {
        // 乱序确认 0、2 再补 1，仍收敛到全部确认
        let mb = 1024 * 1024;
        let mut manager = ChunkManager::new(25 * mb, 10 * mb);

        manager.mark_acked(0);
        manager.mark_acked(2);
        assert_eq!(manager.acked_count(), 2);
        assert!(!manager.is_complete());
        assert!(!manager.is_acked(1));

        manager.mark_acked(1);
        assert!(manager.is_complete());
        assert_eq!(manager.progress(), 100.0);
        assert_eq!(manager.acked_bytes(), 25 * mb);
    }

    #[test]
    fn test_next_pending_skips_uploading_and_acked() {
        let mut manager = ChunkManager::new(16 * 1024 * 1024, 4 * 1024 * 1024);

        manager.mark_uploading(0);
        let next = manager.next_pending().map(|c| c.index);
        assert_eq!(next, Some(1));

        manager.mark_acked(1);
        manager.unmark_uploading(0);
        let next = manager.next_pending().map(|c| c.index);
        assert_eq!(next, Some(0));
    }

    #[test]
    fn test_chunk_size_clamping() {
        // 过小的分片大小被夹到下限
        let manager = ChunkManager::new(10 * 1024 * 1024, 1);
        assert_eq!(manager.chunk_size(), MIN_CHUNK_SIZE);

        // 过大的分片大小被夹到上限
        let manager = ChunkManager::new(10 * 1024 * 1024, u64::MAX);
        assert_eq!(manager.chunk_size(), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_from_descriptor_trusts_server_chunk_size() {
        // 服务端下发的分片大小不做夹取
        let manager = ChunkManager::from_descriptor(100, 40);
        assert_eq!(manager.chunk_size(), 40);
        assert_eq!(manager.chunk_count(), 3);
        assert_eq!(manager.chunks()[2].size(), 20);
    }

    #[test]
    fn test_zero_byte_manager_completes() {
        let mut manager = ChunkManager::new(0, DEFAULT_CHUNK_SIZE);
        assert_eq!(manager.chunk_count(), 1);
        assert!(!manager.is_complete());

        manager.mark_acked(0);
        assert!(manager.is_complete());
        assert_eq!(manager.progress(), 100.0);
    }

    #[test]
    fn test_reset_clears_all_state() {
        let mut manager = ChunkManager::new(16 * 1024 * 1024, 4 * 1024 * 1024);
        manager.mark_acked(0);
        manager.mark_acked(1);
        manager.mark_uploading(2);
        manager.increment_retry(3);

        manager.reset();
        assert_eq!(manager.acked_count(), 0);
        assert!(!manager.is_complete());
        assert!(manager.chunks().iter().all(|c| !c.uploading && c.retries == 0));
    }

    #[tokio::test]
    async fn test_chunk_read_data() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 1000]).unwrap();
        tmp.flush().unwrap();

        let chunk = Chunk::new(1, 300..700);
        let data = chunk.read_data(tmp.path()).await.unwrap();
        assert_eq!(data.len(), 400);
        assert!(data.iter().all(|&b| b == 7));

        // 零长分片读取空缓冲
        let empty = Chunk::new(0, 0..0);
        let data = empty.read_data(tmp.path()).await.unwrap();
        assert!(data.is_empty());
    }

    proptest! {
        // 任意 (N, C) 的分片序列都连续覆盖 [0, N)，无缝隙无重叠，数量为 ceil(N/C)
        #[test]
        fn prop_plan_covers_file(total in 0u64..64 * 1024 * 1024, chunk in MIN_CHUNK_SIZE..8 * 1024 * 1024) {
            let chunks = plan(total, chunk);
            prop_assert_eq!(chunks.len(), chunk_count(total, chunk));

            let mut offset = 0u64;
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index, i);
                prop_assert_eq!(c.range.start, offset);
                prop_assert!(c.range.end >= c.range.start);
                offset = c.range.end;
            }
            prop_assert_eq!(offset, total);
            if total > 0 {
                let expected_last = if total % chunk == 0 { chunk } else { total % chunk };
                prop_assert_eq!(chunks.last().unwrap().size(), expected_last);
            }
        }
    }
}
