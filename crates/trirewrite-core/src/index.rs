//! 外部倒排索引接口（只需要 posting 查询能力）
use std::path::PathBuf;

use crate::trigram::{TrigramQuery, TrigramSet};

pub type FileId = usize;

/// 预先构建好的三元组索引。索引的构建、持久化与新鲜度检测不在本库范围内。
pub trait PostingIndex: Send + Sync {
    /// 返回“可能满足查询”的文件 id；允许误报，不允许漏报
    fn posting_query(&self, query: &TrigramQuery) -> Vec<FileId>;
    /// id 对应的路径；未知 id 返回 None
    fn name(&self, id: FileId) -> Option<PathBuf>;
}

/// 内存索引：保存每个文件的三元组集合，按需求值查询
#[derive(Debug, Default)]
pub struct MemoryIndex {
    paths: Vec<PathBuf>,
    // None 表示内容不是合法 UTF-8，任何查询都要返回它
    sets: Vec<Option<TrigramSet>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<PathBuf>, content: &[u8]) -> FileId {
        self.paths.push(path.into());
        self.sets.push(TrigramSet::from_bytes(content).ok());
        self.paths.len() - 1
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl PostingIndex for MemoryIndex {
    fn posting_query(&self, query: &TrigramQuery) -> Vec<FileId> {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, set)| set.as_ref().map_or(true, |s| query.matches(s)))
            .map(|(id, _)| id)
            .collect()
    }

    fn name(&self, id: FileId) -> Option<PathBuf> {
        self.paths.get(id).cloned()
    }
}
