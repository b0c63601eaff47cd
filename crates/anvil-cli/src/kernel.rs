use anvil_rpc::{
    socket_path, CallArgs, Connector, Endpoint, Engine, EngineConfig, Identity, TcpAcceptor,
};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::cli::KernelArgs;

pub fn run(mut config: EngineConfig, args: KernelArgs) -> Result<()> {
    // The accepting side never announces itself.
    config.identity = None;

    let endpoint = if args.unix {
        Endpoint::Unix(socket_path())
    } else {
        args.listen.parse()?
    };
    let acceptor = bind(&endpoint).with_context(|| format!("Failed to listen on {}", endpoint))?;
    info!(listen = %acceptor.describe(), "Kernel listening");

    let engine = Engine::new(config);
    engine.bind("connect", |args: CallArgs| {
        match Identity::from_handshake(&args.kwargs) {
            Some(identity) => info!(
                service = %identity.service,
                instance = ?identity.instance,
                "Plugin connected"
            ),
            None => info!("Plugin connected without a service name"),
        }
        Ok(Value::Null)
    });
    engine.bind("env", |_args: CallArgs| {
        let vars: Map<String, Value> = std::env::vars()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        Ok(Value::Object(vars))
    });

    engine.serve(acceptor)?;
    Ok(())
}

fn bind(endpoint: &Endpoint) -> Result<Arc<dyn Connector>> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(Arc::new(TcpAcceptor::bind(addr)?)),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Arc::new(anvil_rpc::UnixAcceptor::bind(path.clone())?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => anyhow::bail!("unix sockets are not supported on this platform"),
    }
}
