use anvil_rpc::{socket_path, CallArgs, Endpoint, Engine, EngineConfig, Identity, RpcError};
use anyhow::{bail, Result};
use serde_json::json;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::cli::PluginArgs;

const DEFAULT_SERVICE: &str = "anvil-cli";

pub fn run(mut config: EngineConfig, args: PluginArgs) -> Result<()> {
    if let Some(address) = &args.address {
        config.endpoint = address.parse()?;
    } else if args.unix {
        config.endpoint = Endpoint::Unix(socket_path());
    }
    match (&mut config.identity, args.service) {
        (Some(identity), Some(service)) => identity.service = service,
        (None, service) => {
            let service = service.unwrap_or_else(|| DEFAULT_SERVICE.to_string());
            config.identity = Some(Identity::new(service, ""));
        }
        (Some(_), None) => {}
    }
    config.validate()?;

    let engine = Engine::new(config);
    engine.bind("test", |_args: CallArgs| {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        Ok(json!(format!("CLI: {}", now)))
    });

    info!(endpoint = %engine.config().endpoint, "Starting plugin");
    let io = engine.spawn(engine.config().endpoint.connector())?;

    let env = engine.service("kernel").sync().attr("env");
    let interval = Duration::from_secs(args.interval);
    let mut calls = 0;
    while engine.is_alive() && args.count.map_or(true, |count| calls < count) {
        match env.call(CallArgs::new()) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(RpcError::Remote(e)) => eprintln!("kernel.env failed: {}", e),
            Err(e) if e.is_connection_closed() => warn!("kernel.env: {}", e),
            Err(e) => return Err(e.into()),
        }
        calls += 1;
        if args.count.map_or(true, |count| calls < count) {
            thread::sleep(interval);
        }
    }

    engine.close();
    match io.join() {
        Ok(result) => Ok(result?),
        Err(_) => bail!("I/O thread panicked"),
    }
}
