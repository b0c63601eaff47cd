use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser)]
#[command(name = "anvil")]
#[command(about = "anvil - demo plugin and kernel speaking the anvil RPC protocol")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute (defaults to plugin)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(short = 'l', long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (TOML); environment variables are used otherwise
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to a kernel and poll `kernel.env()`
    Plugin(PluginArgs),
    /// Accept plugin connections and answer `env`
    Kernel(KernelArgs),
}

#[derive(Args, Debug)]
pub struct PluginArgs {
    /// Kernel address (host:port or unix:/path); overrides config
    #[arg(short, long)]
    pub address: Option<String>,

    /// Connect to the default local kernel socket
    #[arg(long, conflicts_with = "address")]
    pub unix: bool,

    /// Service name announced in the handshake; overrides config
    #[arg(short, long)]
    pub service: Option<String>,

    /// Seconds between calls
    #[arg(short, long, default_value = "1")]
    pub interval: u64,

    /// Stop after this many calls
    #[arg(short = 'n', long)]
    pub count: Option<u64>,
}

impl Default for PluginArgs {
    fn default() -> Self {
        Self {
            address: None,
            unix: false,
            service: None,
            interval: 1,
            count: None,
        }
    }
}

#[derive(Args, Debug)]
pub struct KernelArgs {
    /// Address to listen on (host:port or unix:/path)
    #[arg(long, default_value = anvil_rpc::config::DEFAULT_ADDRESS)]
    pub listen: String,

    /// Listen on the default local socket instead of `--listen`
    #[arg(long)]
    pub unix: bool,
}
