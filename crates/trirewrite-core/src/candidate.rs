//! 候选文件枚举：目录遍历 / 索引查询，两者共用同一套路径过滤
use regex::Regex;
use std::ffi::OsStr;
use std::fs::{FileType, Metadata, Permissions};
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::index::PostingIndex;
use crate::trigram::TrigramQuery;

/// 待处理文件（枚举一次，处理一次）
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub permissions: Permissions,
    pub file_type: FileType,
}

impl Candidate {
    pub fn from_metadata(path: PathBuf, md: &Metadata) -> Self {
        Self { path, size: md.len(), permissions: md.permissions(), file_type: md.file_type() }
    }

    /// 不跟随符号链接地读取元数据
    pub fn stat(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let md = std::fs::symlink_metadata(&path).map_err(|e| Error::io("stat", &path, e))?;
        Ok(Self::from_metadata(path, &md))
    }

    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type.is_symlink()
    }

    pub fn is_regular(&self) -> bool {
        self.file_type.is_file()
    }
}

/// 以 `.`、`#`、`~` 开头或以 `~` 结尾的路径段（含 `.git`）
pub fn is_special_name(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with(['.', '#', '~']) || name.ends_with('~')
}

/// include / exclude 路径过滤
#[derive(Debug, Clone, Copy, Default)]
pub struct PathFilter<'a> {
    pub include: Option<&'a Regex>,
    pub exclude: Option<&'a Regex>,
}

impl<'a> PathFilter<'a> {
    pub fn new(include: Option<&'a Regex>, exclude: Option<&'a Regex>) -> Self {
        Self { include, exclude }
    }

    /// 文件是否保留：include 必须匹配，exclude 匹配则一律排除
    pub fn admits(&self, path: &Path) -> bool {
        let s = path.to_string_lossy();
        if let Some(inc) = self.include {
            if !inc.is_match(&s) {
                debug!(path = %s, "skipping: not included");
                return false;
            }
        }
        if let Some(exc) = self.exclude {
            if exc.is_match(&s) {
                debug!(path = %s, "skipping: excluded");
                return false;
            }
        }
        true
    }

    /// 目录是否整体剪枝
    pub fn prunes_dir(&self, path: &Path) -> bool {
        self.exclude.map_or(false, |exc| exc.is_match(&path.to_string_lossy()))
    }
}

/// 深度优先遍历所有根目录，依次把候选交给 `emit`；`emit` 返回 Break 时提前结束
pub fn walk_tree<F>(roots: &[PathBuf], filter: &PathFilter<'_>, mut emit: F) -> Result<()>
where
    F: FnMut(Candidate) -> ControlFlow<()>,
{
    for root in roots {
        // 根目录自身不受特殊名规则约束（例如 tempdir 生成的 .tmpXXXX）
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                if is_special_name(e.file_name()) {
                    debug!(path = %e.path().display(), "skipping: special name");
                    return false;
                }
                !(e.file_type().is_dir() && filter.prunes_dir(e.path()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                Error::Walk { path, source: e }
            })?;
            let ft = entry.file_type();
            if ft.is_dir() {
                continue;
            }
            if ft.is_symlink() {
                debug!(path = %entry.path().display(), "skipping: symlink");
                continue;
            }
            if !filter.admits(entry.path()) {
                continue;
            }
            let md = entry.metadata().map_err(|e| {
                let path = entry.path().to_path_buf();
                Error::Walk { path, source: e }
            })?;
            if md.len() == 0 {
                debug!(path = %entry.path().display(), "skipping: empty file");
                continue;
            }
            if emit(Candidate::from_metadata(entry.into_path(), &md)).is_break() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// 基于外部索引枚举候选：只列出索引声称可能满足查询的路径
///
/// 路径只保留在某个根目录之下的（roots 为空时不限制），
/// 其余过滤规则与目录遍历保持一致。
pub fn index_candidates<F>(
    index: &dyn PostingIndex,
    query: &TrigramQuery,
    roots: &[PathBuf],
    filter: &PathFilter<'_>,
    mut emit: F,
) -> Result<()>
where
    F: FnMut(Candidate) -> ControlFlow<()>,
{
    for id in index.posting_query(query) {
        let Some(path) = index.name(id) else {
            debug!(id, "skipping: unknown index id");
            continue;
        };
        let root = if roots.is_empty() {
            None
        } else {
            match roots.iter().find(|r| path.starts_with(r)) {
                Some(r) => Some(r.as_path()),
                None => {
                    debug!(path = %path.display(), "skipping: outside roots");
                    continue;
                }
            }
        };
        if !passes_structure(&path, root, filter) || !filter.admits(&path) {
            continue;
        }
        let md = match std::fs::symlink_metadata(&path) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "skipping: vanished since indexing");
                continue;
            }
            Err(e) => return Err(Error::io("stat", &path, e)),
        };
        if md.is_dir() || md.file_type().is_symlink() || md.len() == 0 {
            continue;
        }
        if emit(Candidate::from_metadata(path, &md)).is_break() {
            break;
        }
    }
    Ok(())
}

/// 根目录以下的路径段不能是特殊名，各级父目录不能被 exclude 剪枝
fn passes_structure(path: &Path, root: Option<&Path>, filter: &PathFilter<'_>) -> bool {
    let rel = match root {
        Some(r) => path.strip_prefix(r).unwrap_or(path),
        None => path,
    };
    let special = rel.components().any(|c| match c {
        Component::Normal(name) => is_special_name(name),
        _ => false,
    });
    if special {
        debug!(path = %path.display(), "skipping: special name");
        return false;
    }
    let pruned = path
        .ancestors()
        .skip(1)
        .take_while(|a| root.map_or(!a.as_os_str().is_empty(), |r| a.starts_with(r) && *a != r))
        .any(|a| filter.prunes_dir(a));
    if pruned {
        debug!(path = %path.display(), "skipping: excluded directory");
    }
    !pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use std::fs;

    fn collect_walk(root: &Path, filter: &PathFilter<'_>) -> Vec<PathBuf> {
        let mut out = Vec::new();
        walk_tree(&[root.to_path_buf()], filter, |c| {
            out.push(c.path.strip_prefix(root).unwrap().to_path_buf());
            ControlFlow::Continue(())
        })
        .unwrap();
        out
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        fs::create_dir_all(p.join("x/.git")).unwrap();
        fs::create_dir_all(p.join("x/#tmp#")).unwrap();
        fs::write(p.join("x/a"), "hello").unwrap();
        fs::write(p.join("x/c"), "hello").unwrap();
        fs::write(p.join("x/empty"), "").unwrap();
        fs::write(p.join("x/.hidden"), "hello").unwrap();
        fs::write(p.join("x/backup~"), "hello").unwrap();
        fs::write(p.join("x/.git/config"), "hello").unwrap();
        fs::write(p.join("x/#tmp#/inner"), "hello").unwrap();
        dir
    }

    #[test]
    fn special_names() {
        for n in [".git", ".hidden", "#x#", "~lock", "file~"] {
            assert!(is_special_name(OsStr::new(n)), "{n}");
        }
        assert!(!is_special_name(OsStr::new("a.txt")));
    }

    #[test]
    fn walk_skips_structural_entries() {
        let dir = tree();
        let got = collect_walk(dir.path(), &PathFilter::default());
        assert_eq!(got, vec![PathBuf::from("x/a"), PathBuf::from("x/c")]);
    }

    #[test]
    fn walk_applies_include_and_exclude() {
        let dir = tree();
        let include = Regex::new("(a|b)$").unwrap();
        let got = collect_walk(dir.path(), &PathFilter::new(Some(&include), None));
        assert_eq!(got, vec![PathBuf::from("x/a")]);

        let exclude = Regex::new("/x$").unwrap();
        let got = collect_walk(dir.path(), &PathFilter::new(None, Some(&exclude)));
        assert!(got.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn walk_skips_symlinks() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path().join("x/a"), dir.path().join("x/link")).unwrap();
        let got = collect_walk(dir.path(), &PathFilter::default());
        assert!(!got.contains(&PathBuf::from("x/link")));
    }

    #[test]
    fn walk_stops_on_break() {
        let dir = tree();
        let mut seen = 0;
        walk_tree(&[dir.path().to_path_buf()], &PathFilter::default(), |_| {
            seen += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn index_source_applies_same_filters() {
        let dir = tree();
        let p = dir.path();
        let mut idx = MemoryIndex::new();
        for rel in ["x/a", "x/c", "x/empty", "x/.git/config", "x/gone"] {
            idx.add(p.join(rel), b"hello");
        }
        idx.add("/elsewhere/a", b"hello");

        let mut out = Vec::new();
        index_candidates(
            &idx,
            &TrigramQuery::literal(b"hello"),
            &[p.to_path_buf()],
            &PathFilter::default(),
            |c| {
                out.push(c.path);
                ControlFlow::Continue(())
            },
        )
        .unwrap();
        assert_eq!(out, vec![p.join("x/a"), p.join("x/c")]);
    }

    /// 返回一个无法解析的 id 的索引
    struct StaleIndex(PathBuf);

    impl PostingIndex for StaleIndex {
        fn posting_query(&self, _: &TrigramQuery) -> Vec<crate::index::FileId> {
            vec![7, 0]
        }

        fn name(&self, id: crate::index::FileId) -> Option<PathBuf> {
            (id == 0).then(|| self.0.clone())
        }
    }

    #[test]
    fn index_source_skips_unknown_ids() {
        let dir = tree();
        let a = dir.path().join("x/a");
        let mut out = Vec::new();
        let roots = [dir.path().to_path_buf()];
        index_candidates(&StaleIndex(a.clone()), &TrigramQuery::All, &roots, &PathFilter::default(), |c| {
            out.push(c.path);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(out, vec![a]);
    }
}
