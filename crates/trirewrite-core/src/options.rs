//! 运行选项与统计信息（模块）
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 批量划分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPlan {
    /// 按累计字节数切分连续批次，达到阈值即封批
    BySize { target_bytes: u64 },
    /// 均分为 `ceil(N / workers)` 个连续分片
    EvenChunks,
}

impl Default for BatchPlan {
    fn default() -> Self {
        BatchPlan::BySize { target_bytes: DEFAULT_BATCH_BYTES }
    }
}

pub const DEFAULT_BATCH_BYTES: u64 = 1 << 20;

/// 调度方式
/// - Streaming：有界队列逐个分发候选文件，生产者在队列满时阻塞（背压）。
/// - Batch：先完整枚举候选及大小，再按批次静态分配给线程池。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    #[default]
    Streaming,
    Batch(BatchPlan),
}

/// 改写后的回写方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStrategy {
    /// 写同目录临时文件，再 rename 覆盖原文件
    #[default]
    Atomic,
    /// 先删除原文件再写入新内容；两步之间崩溃会丢失文件
    DeleteThenWrite,
}

/// 运行选项（显式传入，不依赖任何全局状态）
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 路径必须匹配（可选）
    pub include: Option<Regex>,
    /// 路径匹配即排除；匹配目录时跳过整个子树
    pub exclude: Option<Regex>,
    /// 线程数：None 表示自动（CPU 核数的两倍）；Some(0) 视为配置错误
    pub workers: Option<usize>,
    pub discipline: Discipline,
    /// 流式队列深度 = workers × queue_multiplier
    pub queue_multiplier: usize,
    pub write_strategy: WriteStrategy,
    /// 树遍历模式下是否对每个文件做三元组预筛
    pub trigram_filter: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            workers: None,
            discipline: Discipline::default(),
            queue_multiplier: 2,
            write_strategy: WriteStrategy::default(),
            trigram_filter: true,
        }
    }
}

impl RunOptions {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| num_cpus::get() * 2)
    }
}

/// 运行统计信息（便于 CLI 打印 / 输出 JSON）
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub candidates: usize,
    pub processed: usize,
    pub rewritten: usize,
    pub unchanged: usize,
    pub skipped_binary: usize,
    pub skipped_prefilter: usize,
    pub skipped_irregular: usize,
    pub bytes_read: u64,
}

/// 跨 worker 共享的计数器
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) candidates: AtomicUsize,
    pub(crate) processed: AtomicUsize,
    pub(crate) rewritten: AtomicUsize,
    pub(crate) unchanged: AtomicUsize,
    pub(crate) skipped_binary: AtomicUsize,
    pub(crate) skipped_prefilter: AtomicUsize,
    pub(crate) skipped_irregular: AtomicUsize,
    pub(crate) bytes_read: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> RunStats {
        RunStats {
            candidates: self.candidates.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            rewritten: self.rewritten.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            skipped_binary: self.skipped_binary.load(Ordering::Relaxed),
            skipped_prefilter: self.skipped_prefilter.load(Ordering::Relaxed),
            skipped_irregular: self.skipped_irregular.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}
