//! 改写规则：加载（参数对 / TSV / TOML）、编译与应用
use regex::bytes::{Regex, RegexSet, RegexSetBuilder};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::trigram::{TrigramQuery, TrigramSet};

/// 未编译的规则：正则源码 + 替换模板（支持 `$1`、`${name}`，`$$` 表示字面 `$`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub pattern: String,
    pub replacement: Vec<u8>,
}

impl RuleSpec {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<Vec<u8>>) -> Self {
        Self { pattern: pattern.into(), replacement: replacement.into() }
    }
}

/// 已编译的单条规则
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    compiled: Regex,
    replacement: Vec<u8>,
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        let compiled = Regex::new(&spec.pattern)
            .map_err(|e| Error::Compile { pattern: spec.pattern.clone(), message: e.to_string() })?;
        Ok(Self { pattern: spec.pattern.clone(), compiled, replacement: spec.replacement.clone() })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }
}

/// 合并检测器的编译上限；超出时放弃检测器，逐条规则判定
const COMBINED_SIZE_LIMIT: usize = 256 * 1024 * 1024;
const COMBINED_DFA_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// 规则集合（非空）：逐条规则 + 合并检测器 + 三元组查询
///
/// 克隆开销很小：`regex` 的克隆共享只读程序，各自持有独立的匹配缓存，
/// 因此每个 worker 持有一份克隆即可，无需跨线程争用缓存。
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    // 只是加速手段，规则太多编译不下时为 None
    combined: Option<RegexSet>,
    query: TrigramQuery,
}

impl RuleSet {
    /// 编译全部规则；第一条非法规则即失败（此时尚未触碰任何文件）
    pub fn compile(specs: &[RuleSpec]) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::Config("no rules provided".into()));
        }
        let rules = specs.iter().map(Rule::compile).collect::<Result<Vec<_>>>()?;

        // 各规则独立编译进同一个 RegexSet，不拼接源码
        let combined = match RegexSetBuilder::new(rules.iter().map(|r| r.pattern.as_str()))
            .size_limit(COMBINED_SIZE_LIMIT)
            .dfa_size_limit(COMBINED_DFA_SIZE_LIMIT)
            .build()
        {
            Ok(set) => Some(set),
            Err(e) => {
                warn!(rules = rules.len(), error = %e, "combined detector unavailable, matching rule by rule");
                None
            }
        };

        let query = rules.iter().try_fold(TrigramQuery::None, |acc, r| {
            TrigramQuery::from_pattern(&r.pattern).map(|q| acc.or(q))
        })?;

        Ok(Self { rules, combined, query })
    }

    /// 从交替出现的 (pattern, replacement) 参数编译
    pub fn from_pairs<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        Self::compile(&specs_from_pairs(args)?)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn query(&self) -> &TrigramQuery {
        &self.query
    }

    /// 任一规则命中即为真；没有合并检测器时逐条判定
    pub fn any_match(&self, content: &[u8]) -> bool {
        match &self.combined {
            Some(set) => set.is_match(content),
            None => self.rules.iter().any(|r| r.compiled.is_match(content)),
        }
    }

    /// 三元组预筛：绝不对会被改写的内容返回 false；非 UTF-8 时回退为 true
    pub fn content_may_match(&self, content: &[u8]) -> bool {
        if self.query.is_all() {
            return true;
        }
        match TrigramSet::from_bytes(content) {
            Ok(set) => self.query.matches(&set),
            Err(_) => true,
        }
    }

    /// 与 `content_may_match` 相同，但复用调用方提供的三元组缓冲
    pub fn content_may_match_with(&self, content: &[u8], scratch: &mut TrigramSet) -> bool {
        if self.query.is_all() {
            return true;
        }
        match scratch.refill(content) {
            Ok(()) => self.query.matches(scratch),
            Err(_) => true,
        }
    }

    /// 按顺序对“当前输出”逐条应用规则，后面的规则能看到前面规则的改动
    pub fn apply(&self, content: &[u8]) -> (Vec<u8>, bool) {
        if let Some(set) = &self.combined {
            if !set.is_match(content) {
                return (content.to_vec(), false);
            }
        }
        let mut out = content.to_vec();
        let mut changed = false;
        for rule in &self.rules {
            // 先判定是否命中（便宜），再替换
            if !rule.compiled.is_match(&out) {
                continue;
            }
            out = rule.compiled.replace_all(&out, rule.replacement.as_slice()).into_owned();
            changed = true;
        }
        (out, changed)
    }
}

/// 交替参数 → 规则列表；个数必须为偶数
pub fn specs_from_pairs<S: AsRef<str>>(args: &[S]) -> Result<Vec<RuleSpec>> {
    if args.len() % 2 != 0 {
        return Err(Error::Config("arguments should be pairs of regexp and replacement".into()));
    }
    Ok(args
        .chunks_exact(2)
        .map(|p| RuleSpec::new(p[0].as_ref(), p[1].as_ref().as_bytes()))
        .collect())
}

/// 解析 TSV 规则：每行 `pattern<TAB>replacement`；`#` 开头为注释，空行忽略
pub fn parse_tsv<R: BufRead>(reader: R) -> Result<Vec<RuleSpec>> {
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| Error::io("read rules", "<input>", e))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 2 {
            return Err(Error::Config(format!(
                "rules line {}: expected 2 tab-separated fields, got {}",
                idx + 1,
                fields.len()
            )));
        }
        out.push(RuleSpec::new(fields[0].trim_start(), fields[1].trim_start().as_bytes()));
    }
    Ok(out)
}

/// 单条规则的配置（支持 pattern 或 regex 字段；其余字段如 id 忽略）
#[derive(Debug, Clone, Deserialize)]
struct RuleEntry {
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    replace: String,
}

/// 顶层规则文件结构
#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 从 TOML 文本解析规则，条目顺序即应用顺序
pub fn parse_toml(txt: &str, path: &Path) -> Result<Vec<RuleSpec>> {
    let parsed: RuleFile = toml::from_str(txt)
        .map_err(|e| Error::RuleFile { path: path.to_path_buf(), message: e.to_string() })?;
    let mut out = Vec::with_capacity(parsed.rules.len());
    for (idx, e) in parsed.rules.into_iter().enumerate() {
        // 兼容两种字段名：pattern 或 regex
        let pat = match (e.pattern, e.regex) {
            (Some(p), _) => p,
            (None, Some(r)) => r,
            _ => {
                return Err(Error::RuleFile {
                    path: path.to_path_buf(),
                    message: format!("rule #{} has neither `pattern` nor `regex`", idx + 1),
                })
            }
        };
        out.push(RuleSpec::new(pat, e.replace.into_bytes()));
    }
    Ok(out)
}

/// 加载规则文件：`.toml` 按表格式解析，其余按 TSV 解析
pub fn load_rules_file(path: &Path) -> Result<Vec<RuleSpec>> {
    let txt = std::fs::read_to_string(path).map_err(|e| Error::io("read", path, e))?;
    match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => parse_toml(&txt, path),
        _ => parse_tsv(txt.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[&str]) -> RuleSet {
        RuleSet::from_pairs(pairs).unwrap()
    }

    #[test]
    fn apply_base() {
        let (out, changed) = set(&["hello", "goodbye"]).apply(b"hello world");
        assert!(changed);
        assert_eq!(out, b"goodbye world");
    }

    #[test]
    fn apply_unchanged() {
        let (out, changed) = set(&["hello", "goodbye"]).apply(b"nothing here");
        assert!(!changed);
        assert_eq!(out, b"nothing here");
    }

    #[test]
    fn later_rules_see_earlier_output() {
        // 第二条规则在第一条规则的输出 "hello1" 中再次命中
        let (out, changed) = set(&["hello", "hello1", "hello", "hello2"]).apply(b"hello");
        assert!(changed);
        assert_eq!(out, b"hello21");

        let (out, _) = set(&["foo", "bar", "bar", "baz"]).apply(b"foo");
        assert_eq!(out, b"baz");
    }

    #[test]
    fn replacement_expands_captures() {
        let (out, _) = set(&[r"(\w+)\.unwrap\(\)", "$1?"]).apply(b"let x = y.unwrap();");
        assert_eq!(out, b"let x = y?;");
        let (out, _) = set(&["price", "$$5"]).apply(b"price");
        assert_eq!(out, b"$5");
    }

    #[test]
    fn compile_error_names_pattern() {
        match RuleSet::from_pairs(&["ok", "x", "(bad", "y"]) {
            Err(Error::Compile { pattern, .. }) => assert_eq!(pattern, "(bad"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_and_odd_inputs_are_config_errors() {
        assert!(matches!(RuleSet::compile(&[]), Err(Error::Config(_))));
        assert!(matches!(RuleSet::from_pairs(&["a"]), Err(Error::Config(_))));
    }

    #[test]
    fn prefilter_rejects_content_without_trigrams() {
        let rs = set(&["hello", "goodbye"]);
        assert!(rs.content_may_match(b"say hello"));
        assert!(!rs.content_may_match(b"say hi"));
        // 非 UTF-8 内容不能被预筛排除
        assert!(rs.content_may_match(b"\xff\xfe say hi"));
    }

    #[test]
    fn prefilter_with_scratch_matches_fresh_evaluation() {
        let rs = set(&["hello", "HELLO", "world", "WORLD"]);
        let mut scratch = TrigramSet::default();
        for input in [&b"hello world"[..], b"world", b"nothing", b"\xc3("] {
            assert_eq!(rs.content_may_match_with(input, &mut scratch), rs.content_may_match(input));
        }
    }

    #[test]
    fn collapse_initial_trigrams() {
        let (out, changed) = set(&["hello", "HELLO", "world", "WORLD"]).apply(b"hello world");
        assert!(changed);
        assert_eq!(out, b"HELLO WORLD");
    }

    #[test]
    fn hundreds_of_word_class_rules() {
        let pairs: Vec<String> = (0..600)
            .flat_map(|i| [format!(r"(\w+)_old{i}\b"), format!("${{1}}_new{i}")])
            .collect();
        let rs = RuleSet::from_pairs(&pairs).unwrap();
        assert_eq!(rs.len(), 600);
        let (out, changed) = rs.apply(b"foo_old7 bar_old250 baz_old599");
        assert!(changed);
        assert_eq!(out, b"foo_new7 bar_new250 baz_new599");
        assert!(rs.content_may_match(b"x_old42"));
        assert!(!rs.content_may_match(b"nothing here"));
    }

    #[test]
    fn verbose_rule_with_trailing_comment() {
        let rs = set(&["(?x) hello # greeting", "bye", "world", "there"]);
        let (out, changed) = rs.apply(b"hello world");
        assert!(changed);
        assert_eq!(out, b"bye there");
        assert!(!rs.content_may_match(b"nothing"));
    }

    #[test]
    fn apply_without_combined_detector() {
        let mut rs = set(&["hello", "hello1", "hello", "hello2"]);
        rs.combined = None;
        assert!(rs.any_match(b"hello"));
        assert!(!rs.any_match(b"bye"));
        assert_eq!(rs.apply(b"hello"), (b"hello21".to_vec(), true));
        assert_eq!(rs.apply(b"bye"), (b"bye".to_vec(), false));
    }

    #[test]
    fn tsv_parsing() {
        let specs = parse_tsv("a\tb\n# comment\n\nc\t d\n".as_bytes()).unwrap();
        assert_eq!(specs, vec![RuleSpec::new("a", "b"), RuleSpec::new("c", "d")]);
        assert!(matches!(parse_tsv("a\tb\nc".as_bytes()), Err(Error::Config(_))));
    }

    #[test]
    fn pair_parsing() {
        assert_eq!(specs_from_pairs(&["a", "b", "c", "d"]).unwrap().len(), 2);
    }

    #[test]
    fn toml_parsing_accepts_both_field_names() {
        let txt = r#"
[[rules]]
id = "one"
pattern = "foo"
replace = "bar"

[[rules]]
regex = "baz"
replace = "qux"
"#;
        let specs = parse_toml(txt, Path::new("rules.toml")).unwrap();
        assert_eq!(specs, vec![RuleSpec::new("foo", "bar"), RuleSpec::new("baz", "qux")]);
        let bad = "[[rules]]\nreplace = \"x\"\n";
        assert!(matches!(parse_toml(bad, Path::new("r.toml")), Err(Error::RuleFile { .. })));
    }
}
