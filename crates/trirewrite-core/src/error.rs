//! 错误分类（编译 / 编码 / IO / 遍历 / 配置）
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// 规则正则（或合并后的检测正则）无法编译
    #[error("invalid pattern `{pattern}`: {message}")]
    Compile { pattern: String, message: String },

    /// 三元组提取时遇到非法的 UTF-8 字节对
    #[error("content is not valid UTF-8 for trigram extraction (offset {offset})")]
    Encoding { offset: usize },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rules file {}: {message}", path.display())]
    RuleFile { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { op, path: path.into(), source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Compile { .. } => "COMPILE_ERROR",
            Error::Encoding { .. } => "ENCODING_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Walk { .. } => "WALK_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::RuleFile { .. } => "RULE_FILE_ERROR",
        }
    }

    /// 在任何文件被触碰之前即可发现的错误
    pub fn is_preflight(&self) -> bool {
        matches!(self, Error::Compile { .. } | Error::Config(_) | Error::RuleFile { .. })
    }
}
