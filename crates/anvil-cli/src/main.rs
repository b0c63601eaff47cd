// anvil - demo plugin and kernel for the anvil RPC engine
//
// `anvil plugin` connects to a kernel, announces itself, exposes `test`, and
// polls `kernel.env()`. `anvil kernel` accepts plugins and answers `env`.

mod cli;
mod kernel;
mod plugin;

use anvil_rpc::{EngineConfig, RpcError};
use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, PluginArgs};
use std::process;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Exit codes for different scenarios
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const CONNECT_ERROR: i32 = 2;
    pub const OTHER_ERROR: i32 = 3;
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from(cli.log_level).into())
                .from_env_lossy(),
        )
        .init();

    let result = load_config(&cli).and_then(|config| match cli.command {
        Some(Commands::Kernel(args)) => kernel::run(config, args),
        Some(Commands::Plugin(args)) => plugin::run(config, args),
        None => plugin::run(config, PluginArgs::default()),
    });

    match result {
        Ok(()) => process::exit(exit_codes::SUCCESS),
        Err(e) => {
            error!("{:#}", e);
            process::exit(exit_code(&e));
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EngineConfig::from_env().context("Invalid ANVIL_* environment")?,
    };
    Ok(config)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::Config(_)) => exit_codes::CONFIG_ERROR,
        Some(e) if e.is_fatal() => exit_codes::CONNECT_ERROR,
        _ if err.downcast_ref::<anvil_rpc::ConfigError>().is_some() => exit_codes::CONFIG_ERROR,
        _ => exit_codes::OTHER_ERROR,
    }
}
