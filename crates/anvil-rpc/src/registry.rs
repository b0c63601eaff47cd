//! Method registry for inbound calls
//!
//! Handlers run on the I/O thread, synchronously, one request at a time. A
//! slow handler therefore delays every other frame on the connection; long
//! work should be handed off to another thread and reported back with a
//! notify or callback call.

use anvil_protocol::{RemoteError, HANDLER_ERROR, PANIC};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kw(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Deserialize the positional arguments, typically into a tuple.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Array(self.args.clone()))
    }

    /// Deserialize the keyword arguments into a struct.
    pub fn parse_kwargs<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.kwargs.clone()))
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }
}

pub type HandlerResult = anyhow::Result<Value>;

/// Callable bound to a method name.
///
/// Failing with a [`RemoteError`] sets the `kind` the caller sees; any other
/// error is reported as `HandlerError` with its cause chain as the trace.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: CallArgs) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(CallArgs) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, args: CallArgs) -> HandlerResult {
        self(args)
    }
}

/// Wrapper that deserializes positional arguments before calling the handler.
struct TypedHandler<F, A, R> {
    method: String,
    handler: F,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<F, A, R> Handler for TypedHandler<F, A, R>
where
    F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn call(&self, args: CallArgs) -> HandlerResult {
        let parsed: A = args
            .parse()
            .map_err(|e| RemoteError::invalid_arguments(&self.method, e))?;
        let result = (self.handler)(parsed)?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Name → handler mapping shared by the engine and the host application.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous binding.
    pub fn bind<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallArgs) -> HandlerResult + Send + Sync + 'static,
    {
        self.bind_handler(name, handler);
    }

    /// Like [`MethodRegistry::bind`], for types implementing [`Handler`].
    pub fn bind_handler(&self, name: impl Into<String>, handler: impl Handler) {
        let name = name.into();
        let previous = self.handlers.write().insert(name.clone(), Arc::new(handler));
        if previous.is_some() {
            warn!(method = %name, "Replaced existing handler");
        } else {
            debug!(method = %name, "Bound handler");
        }
    }

    /// Register a handler whose positional arguments deserialize into `A`.
    ///
    /// ```ignore
    /// registry.bind_typed("add", |(a, b): (i64, i64)| Ok(a + b));
    /// ```
    pub fn bind_typed<F, A, R>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        let name = name.into();
        self.bind_handler(
            name.clone(),
            TypedHandler {
                method: name,
                handler,
                _phantom: PhantomData,
            },
        );
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler bound to `method`, turning every failure mode into a
    /// wire error record.
    pub fn invoke(&self, method: &str, args: CallArgs) -> Result<Value, RemoteError> {
        // Clone out of the lock so handlers may bind/unbind while running.
        let handler = self.handlers.read().get(method).cloned();
        let Some(handler) = handler else {
            warn!(method, "No handler bound");
            return Err(RemoteError::method_not_found(method));
        };

        match catch_unwind(AssertUnwindSafe(|| handler.call(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let remote = handler_error(err);
                error!(method, kind = %remote.kind, "Handler failed: {}", remote.message);
                Err(remote)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method, "Handler panicked: {}", message);
                Err(RemoteError::new(PANIC, message))
            }
        }
    }
}

fn handler_error(err: anyhow::Error) -> RemoteError {
    let trace = format!("{:?}", err);
    match err.downcast::<RemoteError>() {
        Ok(remote) if remote.trace.is_empty() => remote.with_trace(trace),
        Ok(remote) => remote,
        Err(err) => RemoteError::new(HANDLER_ERROR, err.to_string()).with_trace(trace),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_protocol::{INVALID_ARGUMENTS, METHOD_NOT_FOUND};
    use anyhow::Context;
    use serde_json::json;

    #[test]
    fn test_invoke_bound_handler() {
        let registry = MethodRegistry::new();
        registry.bind("echo", |args: CallArgs| {
            Ok(args.get(0).cloned().unwrap_or(Value::Null))
        });

        let result = registry.invoke("echo", CallArgs::new().arg("hi")).unwrap();
        assert_eq!(result, json!("hi"));
        assert!(registry.contains("echo"));
    }

    #[test]
    fn test_missing_method() {
        let registry = MethodRegistry::new();
        let err = registry.invoke("nope", CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, METHOD_NOT_FOUND);
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn test_handler_error_keeps_cause_chain() {
        let registry = MethodRegistry::new();
        registry.bind("fail", |_args: CallArgs| {
            Err(anyhow::anyhow!("disk on fire")).context("boom")
        });

        let err = registry.invoke("fail", CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, HANDLER_ERROR);
        assert_eq!(err.message, "boom");
        assert!(err.trace.contains("disk on fire"));
    }

    #[test]
    fn test_handler_can_choose_error_kind() {
        let registry = MethodRegistry::new();
        registry.bind("strict", |_args: CallArgs| {
            Err(RemoteError::new("ValueError", "bad value").into())
        });

        let err = registry.invoke("strict", CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, "ValueError");
        assert_eq!(err.message, "bad value");
        assert!(!err.trace.is_empty());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let registry = MethodRegistry::new();
        registry.bind("explode", |_args: CallArgs| -> HandlerResult { panic!("kaboom") });

        let err = registry.invoke("explode", CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, PANIC);
        assert_eq!(err.message, "kaboom");

        // Registry still usable afterwards.
        registry.bind("ok", |_args: CallArgs| Ok(json!(1)));
        assert_eq!(registry.invoke("ok", CallArgs::new()).unwrap(), json!(1));
    }

    #[test]
    fn test_typed_handler() {
        let registry = MethodRegistry::new();
        registry.bind_typed("add", |(a, b): (i64, i64)| Ok(a + b));

        let sum = registry
            .invoke("add", CallArgs::new().arg(40).arg(2))
            .unwrap();
        assert_eq!(sum, json!(42));

        let err = registry
            .invoke("add", CallArgs::new().arg("forty"))
            .unwrap_err();
        assert_eq!(err.kind, INVALID_ARGUMENTS);
        assert!(err.message.contains("add"));
    }

    #[test]
    fn test_rebind_and_unbind() {
        let registry = MethodRegistry::new();
        registry.bind("v", |_args: CallArgs| Ok(json!(1)));
        registry.bind("v", |_args: CallArgs| Ok(json!(2)));
        assert_eq!(registry.invoke("v", CallArgs::new()).unwrap(), json!(2));
        assert_eq!(registry.names(), vec!["v".to_string()]);

        assert!(registry.unbind("v"));
        assert!(!registry.unbind("v"));
        assert!(registry.invoke("v", CallArgs::new()).is_err());
    }

    #[test]
    fn test_handler_may_bind_while_running() {
        let registry = Arc::new(MethodRegistry::new());
        let inner = registry.clone();
        registry.bind("install", move |_args: CallArgs| {
            inner.bind("installed", |_args: CallArgs| Ok(json!(true)));
            Ok(Value::Null)
        });

        registry.invoke("install", CallArgs::new()).unwrap();
        assert!(registry.contains("installed"));
    }

    #[test]
    fn test_call_args_parsing() {
        #[derive(serde::Deserialize)]
        struct Opts {
            verbose: bool,
        }

        let args = CallArgs::new().arg(1).arg("x").kwarg("verbose", true);
        let (n, s): (u8, String) = args.parse().unwrap();
        assert_eq!((n, s.as_str()), (1, "x"));
        assert!(args.parse_kwargs::<Opts>().unwrap().verbose);
        assert_eq!(args.kw("verbose"), Some(&json!(true)));
        assert!(!args.is_empty());
    }
}
