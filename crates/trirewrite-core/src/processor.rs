//! 单文件处理：读入 → 二进制判定 → 预筛 → 应用规则 → 回写
use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::candidate::Candidate;
use crate::error::{Error, Result};
use crate::options::WriteStrategy;
use crate::rules::RuleSet;
use crate::trigram::TrigramSet;

/// 二进制判定只看前 8000 字节
pub const BINARY_SNIFF_LEN: usize = 8000;

/// 前 `min(8000, len)` 字节内出现 NUL 即视为二进制
pub fn is_binary(buf: &[u8]) -> bool {
    buf[..buf.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRegular,
    Binary,
    Prefilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    Unchanged,
    Rewritten,
}

/// worker 生命周期：Idle（初始化）→ Running → Drained（来源耗尽）→ Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Drained,
    Done,
}

/// 每个 worker 独占的处理器：自己的规则句柄与可复用缓冲
pub struct Worker {
    id: usize,
    rules: RuleSet,
    buf: Vec<u8>,
    tris: TrigramSet,
    prefilter: bool,
    write: WriteStrategy,
    state: WorkerState,
}

impl Worker {
    pub fn new(id: usize, rules: &RuleSet, prefilter: bool, write: WriteStrategy) -> Self {
        Self {
            id,
            rules: rules.clone(),
            buf: Vec::new(),
            tris: TrigramSet::default(),
            prefilter,
            write,
            state: WorkerState::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: WorkerState) {
        trace!(worker = self.id, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    /// 处理单个候选文件；任何 IO 错误都会原样上抛，由调度器终止整个运行
    pub fn process(&mut self, c: &Candidate) -> Result<Outcome> {
        if !c.is_regular() {
            debug!(path = %c.path.display(), "skipping: not a regular file");
            return Ok(Outcome::Skipped(SkipReason::NotRegular));
        }

        self.read(&c.path, c.size)?;

        if is_binary(&self.buf) {
            debug!(path = %c.path.display(), "skipping: binary");
            return Ok(Outcome::Skipped(SkipReason::Binary));
        }
        if self.prefilter && !self.rules.content_may_match_with(&self.buf, &mut self.tris) {
            trace!(path = %c.path.display(), "skipping: trigram prefilter");
            return Ok(Outcome::Skipped(SkipReason::Prefilter));
        }

        let (out, changed) = self.rules.apply(&self.buf);
        if !changed {
            return Ok(Outcome::Unchanged);
        }
        match self.write {
            WriteStrategy::Atomic => write_atomic(&c.path, &out, &c.permissions)?,
            WriteStrategy::DeleteThenWrite => write_delete_then_write(&c.path, &out, &c.permissions)?,
        }
        debug!(path = %c.path.display(), "rewritten");
        Ok(Outcome::Rewritten)
    }

    /// 读入整个文件；缓冲只在遇到更大的文件时扩容
    fn read(&mut self, path: &Path, size_hint: u64) -> Result<()> {
        let mut file = File::open(path).map_err(|e| Error::io("open", path, e))?;
        self.buf.clear();
        self.buf.reserve(size_hint as usize);
        file.read_to_end(&mut self.buf).map_err(|e| Error::io("read", path, e))?;
        Ok(())
    }
}

/// 同目录建临时文件（`.tmpXXXXXX`，遍历时被跳过）→ 写入 → 设置权限 → persist 覆盖
///
/// 临时文件名长度固定，与原文件名无关；出错时临时文件随 drop 删除。
fn write_atomic(path: &Path, content: &[u8], perms: &Permissions) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io("create", dir, e))?;
    tmp.write_all(content).map_err(|e| Error::io("write", tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io("sync", tmp.path(), e))?;
    tmp.as_file()
        .set_permissions(perms.clone())
        .map_err(|e| Error::io("chmod", tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io("rename", path, e.error))?;
    Ok(())
}

/// 旧行为：先删后写。两步之间崩溃会丢失文件
fn write_delete_then_write(path: &Path, content: &[u8], perms: &Permissions) -> Result<()> {
    fs::remove_file(path).map_err(|e| Error::io("remove", path, e))?;
    fs::write(path, content).map_err(|e| Error::io("write", path, e))?;
    fs::set_permissions(path, perms.clone()).map_err(|e| Error::io("chmod", path, e))
}
