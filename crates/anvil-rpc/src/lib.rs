//! Bidirectional RPC engine
//!
//! Each side of a connection is both client and server: it calls methods on
//! its peer through [`Service`] proxies and answers the peer's calls from a
//! [`MethodRegistry`]. All socket I/O happens on one dedicated thread
//! ([`Engine::serve`] / [`Engine::spawn`]); every other thread only enqueues.
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::from_env()?);
//! engine.bind("ping", |_args| Ok(json!("pong")));
//! let io = engine.spawn(engine.config().endpoint.connector())?;
//!
//! let env = engine.service("kernel").sync().attr("env").call(CallArgs::new())?;
//!
//! engine.close();
//! io.join().ok();
//! ```

pub mod config;
pub mod connection;
mod dispatcher;
mod engine;
pub mod error;
mod event_loop;
mod pending;
mod proxy;
mod registry;

pub use config::{ConfigError, Endpoint, EngineConfig, ReconnectPolicy};
pub use connection::{
    connect_with_retry, BoxedTransport, Connected, Connector, TcpAcceptor, TcpConnector,
    Transport,
};
#[cfg(unix)]
pub use connection::{UnixAcceptor, UnixConnector};
pub use engine::{CallMode, CloseReason, ConnectionState, Engine, Reply};
pub use error::{RpcError, RpcResult};
pub use pending::{Callbacks, Outcome, PendingCalls};
pub use proxy::{Blocking, Callback, Notify, Proxy, Service};
pub use registry::{CallArgs, Handler, HandlerResult, MethodRegistry};

pub use anvil_protocol::{socket_path, CorrelationId, Identity, RemoteError, Target};
