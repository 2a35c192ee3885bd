//! 运行入口与并行调度
//!
//! - Streaming：有界通道逐个分发候选，生产者（遍历/索引）在队列满时阻塞。
//! - Batch：先完整枚举候选，按字节量切成连续批次，批次静态轮转分配给线程池中的 worker。
//! - 任一 worker 出错即记录首个错误并置中止标志：生产者停止枚举，其余 worker 不再领取新文件。
use std::ops::{ControlFlow, Range};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::candidate::{index_candidates, walk_tree, Candidate, PathFilter};
use crate::error::{Error, Result};
use crate::index::PostingIndex;
use crate::options::{BatchPlan, Discipline, RunOptions, RunStats, StatsCounters};
use crate::processor::{Outcome, SkipReason, Worker, WorkerState};
use crate::rules::RuleSet;

/// 一次运行内各 worker 共享的状态
#[derive(Default)]
struct Shared {
    abort: AtomicBool,
    // 只写一次：第一个致命错误
    first_error: OnceLock<Error>,
    counters: StatsCounters,
}

impl Shared {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn fail(&self, err: Error) {
        warn!(error = %err, "aborting run");
        let _ = self.first_error.set(err);
        self.abort.store(true, Ordering::Release);
    }

    /// 处理一个候选并计数；返回 false 表示整个运行必须停止
    fn process_one(&self, w: &mut Worker, c: &Candidate) -> bool {
        let counters = &self.counters;
        counters.processed.fetch_add(1, Ordering::Relaxed);
        match w.process(c) {
            Ok(outcome) => {
                let slot = match outcome {
                    Outcome::Rewritten => &counters.rewritten,
                    Outcome::Unchanged => &counters.unchanged,
                    Outcome::Skipped(SkipReason::Binary) => &counters.skipped_binary,
                    Outcome::Skipped(SkipReason::Prefilter) => &counters.skipped_prefilter,
                    Outcome::Skipped(SkipReason::NotRegular) => &counters.skipped_irregular,
                };
                slot.fetch_add(1, Ordering::Relaxed);
                if outcome != Outcome::Skipped(SkipReason::NotRegular) {
                    counters.bytes_read.fetch_add(c.size, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn finish(self) -> Result<RunStats> {
        let stats = self.counters.snapshot();
        match self.first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

/// 运行一次批量改写
///
/// 成功时所有命中的文件均已改写；失败时返回第一个致命错误，
/// 已完成改写的文件保持改写后的状态。
pub fn run(
    roots: &[PathBuf],
    rules: &RuleSet,
    opts: &RunOptions,
    index: Option<&dyn PostingIndex>,
) -> Result<RunStats> {
    if opts.workers == Some(0) {
        return Err(Error::Config("must configure a non-zero number of workers".into()));
    }
    if roots.is_empty() && index.is_none() {
        return Err(Error::Config("no root directories given".into()));
    }
    let workers = opts.worker_count();
    // 索引已经证明过三元组条件，逐文件预筛可以省掉
    let prefilter = opts.trigram_filter && index.is_none();
    info!(workers, rules = rules.len(), discipline = ?opts.discipline, indexed = index.is_some(), "starting run");

    let ctx = Ctx { roots, rules, opts, index, workers, prefilter };
    let shared = Shared::default();
    match opts.discipline {
        Discipline::Streaming => run_streaming(&ctx, &shared),
        Discipline::Batch(plan) => run_batched(&ctx, &shared, plan),
    }
    let res = shared.finish();
    if let Ok(stats) = &res {
        info!(
            candidates = stats.candidates,
            rewritten = stats.rewritten,
            skipped_prefilter = stats.skipped_prefilter,
            skipped_binary = stats.skipped_binary,
            "run finished"
        );
    }
    res
}

struct Ctx<'a> {
    roots: &'a [PathBuf],
    rules: &'a RuleSet,
    opts: &'a RunOptions,
    index: Option<&'a dyn PostingIndex>,
    workers: usize,
    prefilter: bool,
}

impl Ctx<'_> {
    fn worker(&self, id: usize) -> Worker {
        Worker::new(id, self.rules, self.prefilter, self.opts.write_strategy)
    }

    fn enumerate<F>(&self, emit: F) -> Result<()>
    where
        F: FnMut(Candidate) -> ControlFlow<()>,
    {
        let filter = PathFilter::new(self.opts.include.as_ref(), self.opts.exclude.as_ref());
        match self.index {
            Some(idx) => index_candidates(idx, self.rules.query(), self.roots, &filter, emit),
            None => walk_tree(self.roots, &filter, emit),
        }
    }
}

fn run_streaming(ctx: &Ctx<'_>, shared: &Shared) {
    let depth = ctx.workers * ctx.opts.queue_multiplier.max(1);
    let (tx, rx) = crossbeam_channel::bounded::<Candidate>(depth);

    std::thread::scope(|s| {
        for id in 0..ctx.workers {
            let rx = rx.clone();
            let mut w = ctx.worker(id);
            s.spawn(move || {
                w.transition(WorkerState::Running);
                for c in rx.iter() {
                    if shared.aborted() || !shared.process_one(&mut w, &c) {
                        w.transition(WorkerState::Done);
                        return;
                    }
                }
                w.transition(WorkerState::Drained);
                w.transition(WorkerState::Done);
            });
        }
        // 生产者只持有发送端；所有 worker 退出后 send 会失败
        drop(rx);

        let res = ctx.enumerate(|c| {
            if shared.aborted() {
                return ControlFlow::Break(());
            }
            shared.counters.candidates.fetch_add(1, Ordering::Relaxed);
            match tx.send(c) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
        drop(tx);
        if let Err(e) = res {
            shared.fail(e);
        }
    });
}

fn run_batched(ctx: &Ctx<'_>, shared: &Shared, plan: BatchPlan) {
    let mut cands: Vec<Candidate> = Vec::new();
    let res = ctx.enumerate(|c| {
        cands.push(c);
        ControlFlow::Continue(())
    });
    if let Err(e) = res {
        shared.fail(e);
        return;
    }
    shared.counters.candidates.store(cands.len(), Ordering::Relaxed);

    let sizes: Vec<u64> = cands.iter().map(|c| c.size).collect();
    let batches = partition(&sizes, plan, ctx.workers);

    // 不足两个工作单元：直接在当前线程同步执行
    if batches.len() < 2 {
        let mut w = ctx.worker(0);
        w.transition(WorkerState::Running);
        for c in &cands {
            if !shared.process_one(&mut w, c) {
                return;
            }
        }
        w.transition(WorkerState::Drained);
        w.transition(WorkerState::Done);
        return;
    }

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.workers)
        .thread_name(|i| format!("trirewrite-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            shared.fail(Error::Config(format!("build worker pool: {e}")));
            return;
        }
    };

    let lanes = ctx.workers.min(batches.len());
    let cands = &cands;
    let batches = &batches;
    pool.scope(|s| {
        for id in 0..lanes {
            let mut w = ctx.worker(id);
            s.spawn(move |_| {
                w.transition(WorkerState::Running);
                // 静态轮转分配：worker id 领取第 id, id+lanes, ... 个批次
                for range in batches.iter().skip(id).step_by(lanes) {
                    for c in &cands[range.clone()] {
                        if shared.aborted() || !shared.process_one(&mut w, c) {
                            w.transition(WorkerState::Done);
                            return;
                        }
                    }
                }
                w.transition(WorkerState::Drained);
                w.transition(WorkerState::Done);
            });
        }
    });
}

/// 把按顺序排列的文件大小切分为连续批次（下标区间）
///
/// - `BySize`：累计字节数达到阈值即封批，最后不足阈值的部分单独成批
/// - `EvenChunks`：`ceil(N / workers)` 个元素一批
pub fn partition(sizes: &[u64], plan: BatchPlan, workers: usize) -> Vec<Range<usize>> {
    let n = sizes.len();
    if n == 0 {
        return Vec::new();
    }
    match plan {
        BatchPlan::BySize { target_bytes } => {
            let mut out = Vec::new();
            let mut start = 0;
            let mut acc: u64 = 0;
            for (i, &sz) in sizes.iter().enumerate() {
                acc = acc.saturating_add(sz);
                if acc >= target_bytes {
                    out.push(start..i + 1);
                    start = i + 1;
                    acc = 0;
                }
            }
            if start < n {
                out.push(start..n);
            }
            out
        }
        BatchPlan::EvenChunks => {
            let chunk = n.div_ceil(workers.max(1));
            (0..n).step_by(chunk).map(|s| s..(s + chunk).min(n)).collect()
        }
    }
}
