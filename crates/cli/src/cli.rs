use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Policy runtime supervisor.
///
/// Loads local bundles, polls remote bundle services, and answers policy
/// queries against whatever is currently active.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Policy runtime supervisor")]
pub struct CliArgs {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "WARDEN_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the runtime until interrupted
    Run(RunArgs),
    /// Evaluate a single query and print the result as JSON
    Query(QueryArgs),
    /// Build a bundle tarball from policy and data directories
    Build(BuildArgs),
    /// Start the runtime, wait for readiness and print its status
    Status(StatusArgs),
}

/// Options shared by every command that starts a runtime.
#[derive(Args, Debug)]
pub struct RuntimeArgs {
    /// Config file (.toml, .yaml or .json)
    #[arg(short, long, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local bundle directory or tarball; repeatable, added to the config
    #[arg(short, long = "bundle")]
    pub bundles: Vec<PathBuf>,

    /// Skip bundle digest verification
    #[arg(long)]
    pub skip_verification: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// Reload local bundles when they change on disk
    #[arg(short, long)]
    pub watch: bool,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// Query to evaluate, e.g. `data.authz.allow`
    pub query: String,

    /// Input document as inline JSON
    #[arg(short, long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Input document read from a JSON file
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Explanation mode: off, notes, fails, full or debug
    #[arg(long, default_value = "off")]
    pub explain: String,

    /// Render the explanation as text lines
    #[arg(long)]
    pub pretty: bool,

    /// Attach timers to the output
    #[arg(long)]
    pub metrics: bool,

    /// Attach timers and evaluation counters to the output
    #[arg(long)]
    pub instrument: bool,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Directories (or files) to include
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Output tarball
    #[arg(short, long, default_value = "bundle.tar.gz")]
    pub output: PathBuf,

    /// Revision written to the bundle manifest
    #[arg(short, long)]
    pub revision: Option<String>,

    /// Write `.signatures.json` with SHA-256 digests of every file
    #[arg(long)]
    pub digests: bool,

    /// File name patterns to leave out; repeatable
    #[arg(long)]
    pub ignore: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// Seconds to wait for readiness; defaults to max_plugin_wait_time_seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,
}
