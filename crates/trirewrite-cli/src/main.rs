use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use trirewrite_core::{
    load_rules_file, parse_tsv, run, specs_from_pairs, BatchPlan, Discipline, RuleSet, RunOptions,
    WriteStrategy, DEFAULT_BATCH_BYTES,
};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "trirewrite", version, about = "按规则批量改写目录树中的文本文件")]
struct Cli {
    /// 输出 debug 级别日志（RUST_LOG 优先）
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// 规则来源：--rule 成对给出，或 --rules 指定文件；都没有时从 stdin 读 TSV
#[derive(Args, Debug)]
struct RuleArgs {
    /// 单条规则：正则 + 替换模板（可重复）
    #[arg(long = "rule", num_args = 2, value_names = ["PATTERN", "REPLACEMENT"])]
    rule: Vec<String>,

    /// 规则文件（.toml 或 TSV）
    #[arg(long)]
    rules: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 改写目录树
    Run {
        /// 根目录
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        #[command(flatten)]
        rules: RuleArgs,

        /// 只处理路径匹配该正则的文件
        #[arg(long)]
        include: Option<String>,

        /// 跳过路径匹配该正则的文件与目录
        #[arg(long)]
        exclude: Option<String>,

        /// worker 数（"auto"=CPU 核心数 x2）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 调度方式：streaming 或 batch
        #[arg(long, default_value = "streaming", value_parser = ["streaming", "batch"])]
        discipline: String,

        /// batch 模式下每批的目标字节数
        #[arg(long, default_value_t = DEFAULT_BATCH_BYTES)]
        batch_bytes: u64,

        /// batch 模式下按 worker 数均分，而非按字节量
        #[arg(long)]
        even_chunks: bool,

        /// 先删除再写入（不经临时文件）
        #[arg(long)]
        legacy_write: bool,

        /// 关闭逐文件三元组预筛
        #[arg(long)]
        no_prefilter: bool,

        /// 运行统计写入 JSON 文件
        #[arg(long)]
        stats: Option<PathBuf>,
    },

    /// 打印规则集推导出的三元组查询
    Query {
        #[command(flatten)]
        rules: RuleArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            roots,
            rules,
            include,
            exclude,
            threads,
            discipline,
            batch_bytes,
            even_chunks,
            legacy_write,
            no_prefilter,
            stats,
        } => {
            let rules = load_rules(&rules)?;

            let discipline = match discipline.as_str() {
                "batch" if even_chunks => Discipline::Batch(BatchPlan::EvenChunks),
                "batch" => Discipline::Batch(BatchPlan::BySize { target_bytes: batch_bytes.max(1) }),
                _ => Discipline::Streaming,
            };
            let opts = RunOptions {
                include: compile_path_regex(include.as_deref(), "include")?,
                exclude: compile_path_regex(exclude.as_deref(), "exclude")?,
                workers: parse_threads(&threads)?,
                discipline,
                write_strategy: if legacy_write { WriteStrategy::DeleteThenWrite } else { WriteStrategy::Atomic },
                trigram_filter: !no_prefilter,
                ..Default::default()
            };

            let run_stats = run(&roots, &rules, &opts, None).context("rewrite failed")?;
            info!(
                processed = run_stats.processed,
                rewritten = run_stats.rewritten,
                "done"
            );

            if let Some(path) = stats {
                // 以缓冲方式打开统计文件，写入一个 JSON 对象
                let mut out = BufWriter::new(File::create(&path).context("create stats file")?);
                serde_json::to_writer_pretty(&mut out, &run_stats).context("write stats")?;
                out.write_all(b"\n")?;
                out.flush().context("flush stats file")?;
            }
        }
        Commands::Query { rules } => {
            let rules = load_rules(&rules)?;
            println!("{}", rules.query());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load_rules(args: &RuleArgs) -> Result<RuleSet> {
    let mut specs = specs_from_pairs(args.rule.as_slice())?;
    if let Some(path) = &args.rules {
        specs.extend(load_rules_file(path).with_context(|| format!("load rules from {}", path.display()))?);
    }
    if args.rule.is_empty() && args.rules.is_none() {
        let stdin = std::io::stdin();
        specs = parse_tsv(stdin.lock()).context("read rules from stdin")?;
    }
    RuleSet::compile(&specs).context("compile rules")
}

fn compile_path_regex(re: Option<&str>, what: &str) -> Result<Option<Regex>> {
    re.map(|s| Regex::new(s).with_context(|| format!("invalid --{what} pattern")))
        .transpose()
}

/// 解析线程参数："auto" 表示自动；其他必须是正整数
fn parse_threads(s: &str) -> Result<Option<usize>> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(Some(n)),
        _ => bail!("--threads must be \"auto\" or a positive integer, got {s:?}"),
    }
}
