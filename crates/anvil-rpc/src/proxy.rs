//! Service proxies
//!
//! A [`Service`] names a remote service. It hands out [`Proxy`] values in one
//! of three calling modes, fixed at the type level so `call` returns what the
//! mode delivers:
//!
//! ```ignore
//! let kernel = engine.service("kernel");
//! let env = kernel.sync().attr("env").call(CallArgs::new())?;
//! kernel.notify().path("log.info").call(CallArgs::new().arg("hello"))?;
//! let id = kernel
//!     .callback(|v| println!("{v}"), |e| eprintln!("{e}"))
//!     .attr("env")
//!     .call(CallArgs::new())?;
//! ```

use anvil_protocol::{CorrelationId, Target};
use serde_json::Value;
use std::time::Duration;

use crate::engine::{CallMode, Engine, Reply};
use crate::error::{RpcError, RpcResult};
use crate::pending::Callbacks;
use crate::registry::CallArgs;

/// A remote service, addressed by node, name, and optional instance.
#[derive(Clone, Debug)]
pub struct Service {
    engine: Engine,
    target: Target,
}

impl Service {
    pub(crate) fn new(engine: Engine, target: Target) -> Self {
        Self { engine, target }
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.target.node = node.into();
        self
    }

    pub fn instance(mut self, instance: i64) -> Self {
        self.target.instance = Some(instance);
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn sync(&self) -> Proxy<Blocking> {
        self.proxy(Blocking { timeout: None })
    }

    pub fn callback<S, E>(&self, on_success: S, on_error: E) -> Proxy<Callback>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(RpcError) + Send + 'static,
    {
        self.with_callbacks(Callbacks::new(on_success, on_error))
    }

    pub fn with_callbacks(&self, callbacks: Callbacks) -> Proxy<Callback> {
        self.proxy(Callback { callbacks })
    }

    pub fn notify(&self) -> Proxy<Notify> {
        self.proxy(Notify)
    }

    fn proxy<M>(&self, mode: M) -> Proxy<M> {
        Proxy {
            engine: self.engine.clone(),
            target: self.target.clone(),
            path: Vec::new(),
            mode,
        }
    }
}

/// Wait for the result on the calling thread.
#[derive(Clone, Debug)]
pub struct Blocking {
    timeout: Option<Duration>,
}

/// Deliver the result to a continuation on the I/O thread.
#[derive(Debug)]
pub struct Callback {
    callbacks: Callbacks,
}

/// Send without expecting a response.
#[derive(Clone, Copy, Debug)]
pub struct Notify;

/// A dotted method path bound to a service and a calling mode.
#[derive(Clone, Debug)]
pub struct Proxy<M> {
    engine: Engine,
    target: Target,
    path: Vec<String>,
    mode: M,
}

impl<M> Proxy<M> {
    /// Append one path segment.
    pub fn attr(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// Append every segment of a dotted path.
    pub fn path(mut self, dotted: &str) -> Self {
        self.path.extend(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        self
    }

    /// The method name this proxy calls, if it has one.
    pub fn method(&self) -> Option<String> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.join("."))
        }
    }

    fn invoke(&self, args: CallArgs, mode: CallMode) -> RpcResult<Reply> {
        let method = self.method().ok_or(RpcError::NoMethodPath)?;
        self.engine.call(self.target.clone(), method, args, mode)
    }
}

impl Proxy<Blocking> {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.mode.timeout = Some(timeout);
        self
    }

    pub fn call(&self, args: CallArgs) -> RpcResult<Value> {
        let mode = CallMode::Blocking {
            timeout: self.mode.timeout,
        };
        match self.invoke(args, mode)? {
            Reply::Value(value) => Ok(value),
            _ => Err(RpcError::ConnectionClosed),
        }
    }
}

impl Proxy<Callback> {
    /// Consumes the proxy: each continuation pair serves one call.
    pub fn call(self, args: CallArgs) -> RpcResult<CorrelationId> {
        let method = self.method().ok_or(RpcError::NoMethodPath)?;
        let mode = CallMode::Callback(self.mode.callbacks);
        match self.engine.call(self.target, method, args, mode)? {
            Reply::Pending(id) => Ok(id),
            _ => Err(RpcError::ConnectionClosed),
        }
    }
}

impl Proxy<Notify> {
    pub fn call(&self, args: CallArgs) -> RpcResult<()> {
        self.invoke(args, CallMode::Notify).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn service() -> Service {
        Engine::new(EngineConfig::default()).service("kernel")
    }

    #[test]
    fn test_path_building() {
        let proxy = service().notify().attr("world").path("blocks.set");
        assert_eq!(proxy.method().as_deref(), Some("world.blocks.set"));

        let proxy = service().notify().path("..a..b.");
        assert_eq!(proxy.method().as_deref(), Some("a.b"));
    }

    #[test]
    fn test_empty_path_is_an_error() {
        let err = service().notify().call(CallArgs::new()).unwrap_err();
        assert!(matches!(err, RpcError::NoMethodPath));

        let err = service()
            .callback(|_| {}, |_| {})
            .call(CallArgs::new())
            .unwrap_err();
        assert!(matches!(err, RpcError::NoMethodPath));
    }

    #[test]
    fn test_target_addressing() {
        let svc = service().node("node-7").instance(3);
        assert_eq!(svc.target().node, "node-7");
        assert_eq!(svc.target().service.as_deref(), Some("kernel"));
        assert_eq!(svc.target().instance, Some(3));
    }

    #[test]
    fn test_proxies_are_independent() {
        let svc = service();
        let base = svc.sync().attr("world");
        let a = base.clone().attr("a");
        let b = base.attr("b");
        assert_eq!(a.method().as_deref(), Some("world.a"));
        assert_eq!(b.method().as_deref(), Some("world.b"));
    }
}
