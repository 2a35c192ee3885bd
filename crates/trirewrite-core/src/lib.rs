//! 基于规则的批量文本改写核心库
//!
//! 设计要点：
//! - 规则按顺序作用于“当前输出”，后面的规则能看到前面规则的改动。
//! - 三元组预筛（trigram）只是加速：允许误报，绝不漏报；内容非 UTF-8 时回退到精确匹配。
//! - 调度支持流式（有界队列）与按字节量分批两种方式，首个致命错误即中止整个运行。
//! - 改写默认先写临时文件再 rename，保留原文件权限位。

mod candidate;
mod error;
mod index;
mod options;
mod processor;
mod rules;
mod scheduler;
mod trigram;

pub use candidate::{index_candidates, is_special_name, walk_tree, Candidate, PathFilter};
pub use error::{Error, Result};
pub use index::{FileId, MemoryIndex, PostingIndex};
pub use options::{BatchPlan, Discipline, RunOptions, RunStats, WriteStrategy, DEFAULT_BATCH_BYTES};
pub use processor::{is_binary, Outcome, SkipReason, Worker, WorkerState, BINARY_SNIFF_LEN};
pub use rules::{load_rules_file, parse_toml, parse_tsv, specs_from_pairs, Rule, RuleSet, RuleSpec};
pub use scheduler::{partition, run};
pub use trigram::{pack, valid_utf8_pair, Trigram, TrigramQuery, TrigramSet};
