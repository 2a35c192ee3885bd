//! 三元组预筛（trigram）
//!
//! 设计要点：
//! - 从规则正则的 HIR 推导一棵 AND/OR 三元组查询树，只允许误报、绝不漏报。
//! - 文件内容按 3 字节滑窗提取三元组集合，同时校验相邻字节是否构成合法 UTF-8 过渡。
//! - 预筛只是加速手段：内容非 UTF-8 时由调用方回退到精确匹配，而不是直接排除。

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use regex_syntax::hir::{Class, Hir, HirKind, Repetition};

use crate::error::{Error, Result};

/// 24 位三元组（高位字节在前）
pub type Trigram = u32;

/// 精确串集合的上限：超过则退化为查询
const MAX_EXACT_SET: usize = 64;
const MAX_EXACT_LEN: usize = 256;
/// 字符类展开上限（成员数）
const MAX_CLASS_EXPANSION: u32 = 16;

#[inline]
pub fn pack(a: u8, b: u8, c: u8) -> Trigram {
    (a as u32) << 16 | (b as u32) << 8 | c as u32
}

/// 判断字节对 (c1, c2) 能否出现在合法的 UTF-8 序列中
#[inline]
pub fn valid_utf8_pair(c1: u8, c2: u8) -> bool {
    match c1 {
        // 单字节：后面只能是单字节或多字节首字节
        0x00..=0x7F => c2 < 0x80 || (0xC0..0xF8).contains(&c2),
        // 续字节：后面几乎什么都可以
        0x80..=0xBF => c2 < 0xF8,
        // 多字节首字节：后面必须是续字节
        0xC0..=0xF7 => (0x80..0xC0).contains(&c2),
        _ => false,
    }
}

/// 缓冲区内出现过的全部三元组
#[derive(Debug, Default, Clone)]
pub struct TrigramSet {
    tris: HashSet<Trigram>,
}

impl TrigramSet {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut set = Self::default();
        set.refill(buf)?;
        Ok(set)
    }

    /// 复用已有容量重新提取；遇到第一个非法字节对即返回 `Error::Encoding`
    pub fn refill(&mut self, buf: &[u8]) -> Result<()> {
        self.tris.clear();
        let mut prev = 0u8;
        let mut tv: u32 = 0;
        for (i, &c) in buf.iter().enumerate() {
            if !valid_utf8_pair(prev, c) {
                self.tris.clear();
                return Err(Error::Encoding { offset: i });
            }
            tv = ((tv << 8) | c as u32) & 0x00FF_FFFF;
            if i >= 2 {
                self.tris.insert(tv);
            }
            prev = c;
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, t: Trigram) -> bool {
        self.tris.contains(&t)
    }

    pub fn len(&self) -> usize {
        self.tris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tris.is_empty()
    }
}

/// 三元组布尔查询
///
/// - `And`：所有三元组都出现，且所有子查询为真
/// - `Or`：至少一个三元组出现，或至少一个子查询为真
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrigramQuery {
    All,
    None,
    And { trigrams: Vec<Trigram>, subs: Vec<TrigramQuery> },
    Or { trigrams: Vec<Trigram>, subs: Vec<TrigramQuery> },
}

impl TrigramQuery {
    /// 从正则源码推导查询（按 bytes 正则语义解析）
    pub fn from_pattern(pattern: &str) -> Result<Self> {
        let hir = regex_syntax::ParserBuilder::new()
            .utf8(false)
            .build()
            .parse(pattern)
            .map_err(|e| Error::Compile { pattern: pattern.to_string(), message: e.to_string() })?;
        Ok(analyze(&hir).into_query())
    }

    /// 单个字面量串对应的查询：所有三元组的 AND；短于 3 字节则无法约束
    pub fn literal(s: &[u8]) -> Self {
        if s.len() < 3 {
            return TrigramQuery::All;
        }
        let mut trigrams: Vec<Trigram> = s.windows(3).map(|w| pack(w[0], w[1], w[2])).collect();
        trigrams.sort_unstable();
        trigrams.dedup();
        TrigramQuery::And { trigrams, subs: Vec::new() }
    }

    pub fn and(self, other: Self) -> Self {
        use TrigramQuery::*;
        match (self, other) {
            (None, _) | (_, None) => None,
            (All, q) | (q, All) => q,
            (And { trigrams: mut t1, subs: mut s1 }, And { trigrams: t2, subs: s2 }) => {
                t1.extend(t2);
                t1.sort_unstable();
                t1.dedup();
                s1.extend(s2);
                And { trigrams: t1, subs: s1 }
            }
            (And { trigrams, mut subs }, q) | (q, And { trigrams, mut subs }) => {
                subs.push(q);
                And { trigrams, subs }
            }
            (a, b) => And { trigrams: Vec::new(), subs: vec![a, b] },
        }
    }

    pub fn or(self, other: Self) -> Self {
        use TrigramQuery::*;
        match (self, other) {
            (All, _) | (_, All) => All,
            (None, q) | (q, None) => q,
            (a, b) => {
                let mut trigrams = Vec::new();
                let mut subs = Vec::new();
                for q in [a, b] {
                    match q {
                        Or { trigrams: t, subs: s } => {
                            trigrams.extend(t);
                            subs.extend(s);
                        }
                        And { trigrams: t, subs: s } if t.len() == 1 && s.is_empty() => trigrams.extend(t),
                        other => subs.push(other),
                    }
                }
                trigrams.sort_unstable();
                trigrams.dedup();
                Or { trigrams, subs }
            }
        }
    }

    /// 对三元组集合求值
    pub fn matches(&self, set: &TrigramSet) -> bool {
        match self {
            TrigramQuery::All => true,
            TrigramQuery::None => false,
            TrigramQuery::And { trigrams, subs } => {
                trigrams.iter().all(|&t| set.contains(t)) && subs.iter().all(|q| q.matches(set))
            }
            TrigramQuery::Or { trigrams, subs } => {
                trigrams.iter().any(|&t| set.contains(t)) || subs.iter().any(|q| q.matches(set))
            }
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TrigramQuery::All)
    }
}

impl fmt::Display for TrigramQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_tri(f: &mut fmt::Formatter<'_>, t: Trigram) -> fmt::Result {
            let bytes = [(t >> 16) as u8, (t >> 8) as u8, t as u8];
            write!(f, "{:?}", String::from_utf8_lossy(&bytes))
        }
        let (trigrams, subs, sep) = match self {
            TrigramQuery::All => return write!(f, "+"),
            TrigramQuery::None => return write!(f, "-"),
            TrigramQuery::And { trigrams, subs } => (trigrams, subs, " "),
            TrigramQuery::Or { trigrams, subs } => (trigrams, subs, "|"),
        };
        write!(f, "(")?;
        let mut first = true;
        for &t in trigrams {
            if !first { write!(f, "{sep}")?; } else { first = false; }
            write_tri(f, t)?;
        }
        for q in subs {
            if !first { write!(f, "{sep}")?; } else { first = false; }
            write!(f, "{q}")?;
        }
        write!(f, ")")
    }
}

/// HIR 节点摘要：
/// - `exact = Some(S)`：节点恰好匹配 S 中的串（此时 `query` 恒为 All）
/// - `exact = None`：`query` 是任何匹配所在内容的必要条件
struct Info {
    exact: Option<BTreeSet<Vec<u8>>>,
    query: TrigramQuery,
}

impl Info {
    fn any() -> Self {
        Self { exact: None, query: TrigramQuery::All }
    }

    fn empty_string() -> Self {
        Self::from_set(BTreeSet::from([Vec::new()]))
    }

    fn from_set(set: BTreeSet<Vec<u8>>) -> Self {
        if set.len() <= MAX_EXACT_SET && set.iter().all(|s| s.len() <= MAX_EXACT_LEN) {
            Self { exact: Some(set), query: TrigramQuery::All }
        } else {
            Self { exact: None, query: set_query(&set) }
        }
    }

    fn into_query(self) -> TrigramQuery {
        match self.exact {
            Some(set) => set_query(&set),
            None => self.query,
        }
    }
}

/// 精确串集合 → OR(AND(三元组))；空集表示不可能匹配
fn set_query(set: &BTreeSet<Vec<u8>>) -> TrigramQuery {
    set.iter()
        .fold(TrigramQuery::None, |acc, s| acc.or(TrigramQuery::literal(s)))
}

fn cross(a: &BTreeSet<Vec<u8>>, b: &BTreeSet<Vec<u8>>) -> Option<BTreeSet<Vec<u8>>> {
    if a.len().checked_mul(b.len())? > MAX_EXACT_SET {
        return None;
    }
    let mut out = BTreeSet::new();
    for x in a {
        for y in b {
            if x.len() + y.len() > MAX_EXACT_LEN {
                return None;
            }
            let mut s = Vec::with_capacity(x.len() + y.len());
            s.extend_from_slice(x);
            s.extend_from_slice(y);
            out.insert(s);
        }
    }
    Some(out)
}

fn concat(a: Info, b: Info) -> Info {
    if let (Some(x), Some(y)) = (&a.exact, &b.exact) {
        if let Some(prod) = cross(x, y) {
            return Info::from_set(prod);
        }
    }
    Info { exact: None, query: a.into_query().and(b.into_query()) }
}

fn analyze(hir: &Hir) -> Info {
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => Info::empty_string(),
        HirKind::Literal(lit) => Info::from_set(BTreeSet::from([lit.0.to_vec()])),
        HirKind::Class(class) => match expand_class(class) {
            Some(set) => Info::from_set(set),
            None => Info::any(),
        },
        HirKind::Capture(cap) => analyze(&cap.sub),
        HirKind::Repetition(rep) => analyze_repetition(rep),
        HirKind::Concat(subs) => subs.iter().map(analyze).fold(Info::empty_string(), concat),
        HirKind::Alternation(alts) => {
            let children: Vec<Info> = alts.iter().map(analyze).collect();
            if children.iter().all(|c| c.exact.is_some()) {
                let union: BTreeSet<Vec<u8>> = children
                    .iter()
                    .flat_map(|c| c.exact.iter().flatten().cloned())
                    .collect();
                if union.len() <= MAX_EXACT_SET {
                    return Info::from_set(union);
                }
            }
            let query = children
                .into_iter()
                .fold(TrigramQuery::None, |acc, c| acc.or(c.into_query()));
            Info { exact: None, query }
        }
    }
}

fn analyze_repetition(rep: &Repetition) -> Info {
    let sub = analyze(&rep.sub);
    if rep.min == 0 {
        if rep.max == Some(0) {
            return Info::empty_string();
        }
        // `x?` 仍可枚举
        if let (Some(1), Some(set)) = (rep.max, &sub.exact) {
            let mut set = set.clone();
            set.insert(Vec::new());
            return Info::from_set(set);
        }
        return Info::any();
    }
    if rep.max == Some(rep.min) {
        if let Some(set) = &sub.exact {
            let mut acc = set.clone();
            let mut bounded = true;
            for _ in 1..rep.min {
                match cross(&acc, set) {
                    Some(next) => acc = next,
                    None => {
                        bounded = false;
                        break;
                    }
                }
            }
            if bounded {
                return Info::from_set(acc);
            }
        }
    }
    // 至少出现一次：子表达式的必要条件仍成立
    Info { exact: None, query: sub.into_query() }
}

/// 小字符类展开为其成员的编码串；过大则返回 None
fn expand_class(class: &Class) -> Option<BTreeSet<Vec<u8>>> {
    let mut out = BTreeSet::new();
    match class {
        Class::Unicode(cls) => {
            let size: u32 = cls.iter().map(|r| r.end() as u32 - r.start() as u32 + 1).sum();
            if size > MAX_CLASS_EXPANSION {
                return None;
            }
            let mut buf = [0u8; 4];
            for r in cls.iter() {
                for c in r.start()..=r.end() {
                    out.insert(c.encode_utf8(&mut buf).as_bytes().to_vec());
                }
            }
        }
        Class::Bytes(cls) => {
            let size: u32 = cls.iter().map(|r| r.end() as u32 - r.start() as u32 + 1).sum();
            if size > MAX_CLASS_EXPANSION {
                return None;
            }
            for r in cls.iter() {
                for b in r.start()..=r.end() {
                    out.insert(vec![b]);
                }
            }
        }
    }
    Some(out)
}
