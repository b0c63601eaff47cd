//! The engine handle and its connection lifecycle
//!
//! An [`Engine`] is a cheap, cloneable handle. Any thread may bind methods
//! and issue calls through it; exactly one thread runs [`Engine::serve`],
//! which owns the transport for the engine's whole life.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!      ^                                            |
//!      +------------ transport/protocol loss -------+
//!
//! any state --close()--> Closing -> Closed(Planned)
//! Connecting --retries exhausted--> Closed(Fatal)
//! ```

use anvil_protocol::{CorrelationId, Frame, Request, Target};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connection::{connect_with_retry, Connection, Connector};
use crate::dispatcher;
use crate::error::{RpcError, RpcResult};
use crate::event_loop::{self, SessionEnd};
use crate::pending::{Callbacks, PendingCalls};
use crate::proxy::Service;
use crate::registry::{CallArgs, HandlerResult, MethodRegistry};

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected; the handshake is queued ahead of all other traffic.
    Authenticating,
    Ready,
    Closing,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Planned,
    /// The connector failed for good.
    Fatal,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Closed(CloseReason::Planned) => write!(f, "closed"),
            Self::Closed(CloseReason::Fatal) => write!(f, "closed (fatal)"),
        }
    }
}

/// How [`Engine::call`] delivers the outcome.
pub enum CallMode {
    /// Block the calling thread. `None` falls back to the configured call
    /// timeout, which itself defaults to waiting indefinitely.
    Blocking { timeout: Option<Duration> },
    /// Return immediately; one of the callbacks runs on the I/O thread.
    Callback(Callbacks),
    /// Fire-and-forget. No id is allocated and no response is expected.
    Notify,
}

/// What [`Engine::call`] returned, per [`CallMode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Pending(CorrelationId),
    Sent,
}

/// State shared between handles and the I/O thread.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: MethodRegistry,
    pub(crate) pending: PendingCalls,
    /// Frames submitted by callers, waiting for the I/O thread.
    outbox_tx: flume::Sender<Frame>,
    pub(crate) outbox: flume::Receiver<Frame>,
    next_id: AtomicU64,
    alive: AtomicBool,
    serving: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    io_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    pub(crate) fn new(config: EngineConfig) -> Self {
        let (outbox_tx, outbox) = flume::unbounded();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry: MethodRegistry::new(),
            pending: PendingCalls::new(),
            outbox_tx,
            outbox,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            serving: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            state,
            epoch: AtomicU64::new(0),
            io_thread: Mutex::new(None),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn enqueue(&self, frame: Frame) {
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.outbox_tx.send(frame);
    }

    fn on_io_thread(&self) -> bool {
        *self.io_thread.lock() == Some(thread::current().id())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "State change");
        }
    }

    /// A correlated request whose pending entry is gone. Its caller has
    /// already been failed or has timed out, so it must not be sent.
    pub(crate) fn is_withdrawn(&self, frame: &Frame) -> bool {
        match frame {
            Frame::Request(Request { id: Some(id), .. }) => !self.pending.contains(*id),
            _ => false,
        }
    }

    /// Discard queued-but-unsent requests, then fail everything pending.
    ///
    /// A caller can register between the drain and `fail_all` and enqueue
    /// afterwards; its frame then survives in the outbox with no pending
    /// entry, and the I/O loop drops it via [`Shared::is_withdrawn`].
    fn reset(&self) {
        let discarded = self.outbox.drain().count();
        let failed = self.pending.fail_all();
        if discarded > 0 || failed > 0 {
            info!(discarded, failed, "Reset connection state");
        }
    }

    fn finish(&self, reason: CloseReason) {
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.reset();
        self.set_state(ConnectionState::Closed(reason));
    }
}

/// Handle to a bidirectional RPC engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.shared.registry
    }

    pub fn bind<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallArgs) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.registry.bind(name, handler);
    }

    pub fn bind_typed<F, A, R>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        self.shared.registry.bind_typed(name, handler);
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.shared.registry.unbind(name)
    }

    /// Proxy root for `name` on the local node.
    pub fn service(&self, name: impl Into<String>) -> Service {
        Service::new(self.clone(), Target::service(name))
    }

    /// Issue a call to `method` on `target`.
    pub fn call(
        &self,
        target: Target,
        method: impl Into<String>,
        args: CallArgs,
        mode: CallMode,
    ) -> RpcResult<Reply> {
        let method = method.into();
        if method.is_empty() {
            return Err(RpcError::NoMethodPath);
        }

        match mode {
            CallMode::Notify => {
                dispatcher::dispatch(&self.shared, target, method, args, None)?;
                Ok(Reply::Sent)
            }
            CallMode::Callback(callbacks) => {
                match dispatcher::dispatch(&self.shared, target, method, args, Some(callbacks))? {
                    Some(id) => Ok(Reply::Pending(id)),
                    None => Ok(Reply::Sent),
                }
            }
            CallMode::Blocking { timeout } => {
                let timeout = timeout.or_else(|| self.shared.config.call_timeout());
                self.call_blocking(target, method, args, timeout)
                    .map(Reply::Value)
            }
        }
    }

    fn call_blocking(
        &self,
        target: Target,
        method: String,
        args: CallArgs,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        if self.shared.on_io_thread() {
            warn!(%method, "Refusing blocking call on the I/O thread");
            return Err(RpcError::BlockingOnIoThread);
        }

        let (tx, rx) = flume::bounded(1);
        let callbacks = Callbacks::from_fn(move |outcome| {
            let _ = tx.send(outcome);
        });
        let id = dispatcher::dispatch(&self.shared, target, method, args, Some(callbacks))?;

        let Some(timeout) = timeout else {
            return rx.recv().map_err(|_| RpcError::ConnectionClosed)?;
        };
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(flume::RecvTimeoutError::Timeout) => {
                let withdrawn = id.map_or(false, |id| self.shared.pending.take(id).is_some());
                if withdrawn {
                    Err(RpcError::Timeout(timeout))
                } else {
                    // Completed between the timeout and the withdrawal.
                    rx.recv().map_err(|_| RpcError::ConnectionClosed)?
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Run the I/O loop on the current thread until `close()` or a fatal
    /// connect failure.
    pub fn serve(&self, connector: Arc<dyn Connector>) -> RpcResult<()> {
        if self.shared.serving.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyServing);
        }
        *self.shared.io_thread.lock() = Some(thread::current().id());

        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RpcError::from)
            .and_then(|runtime| runtime.block_on(serve_loop(&self.shared, connector)));

        match &result {
            Ok(()) => {
                info!("Engine stopped");
                self.shared.finish(CloseReason::Planned);
            }
            Err(e) => {
                error!("Engine stopped: {}", e);
                self.shared.finish(CloseReason::Fatal);
            }
        }
        *self.shared.io_thread.lock() = None;
        self.shared.serving.store(false, Ordering::SeqCst);
        result
    }

    /// [`Engine::serve`] over the configured endpoint.
    pub fn run(&self) -> RpcResult<()> {
        self.serve(self.shared.config.endpoint.connector())
    }

    /// Start [`Engine::serve`] on a dedicated `anvil-io` thread.
    pub fn spawn(
        &self,
        connector: Arc<dyn Connector>,
    ) -> std::io::Result<JoinHandle<RpcResult<()>>> {
        let engine = self.clone();
        thread::Builder::new()
            .name("anvil-io".to_string())
            .spawn(move || engine.serve(connector))
    }

    /// Stop the engine. Every pending call fails with
    /// [`RpcError::ConnectionClosed`] and later calls fail immediately.
    pub fn close(&self) {
        if self.shared.alive.swap(false, Ordering::SeqCst) {
            info!("Closing engine");
        }
        if !self.state().is_closed() {
            self.shared.set_state(ConnectionState::Closing);
        }
        self.shared.shutdown.cancel();
        self.shared.reset();
        if !self.shared.serving.load(Ordering::SeqCst) {
            self.shared.set_state(ConnectionState::Closed(CloseReason::Planned));
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Block until the engine is ready or closed. Returns true if ready.
    ///
    /// Only meaningful once `serve` or `spawn` has been called.
    pub fn wait_ready(&self) -> bool {
        let mut state = self.subscribe_state();
        futures::executor::block_on(async move {
            match state.wait_for(|s| s.is_ready() || s.is_closed()).await {
                Ok(s) => s.is_ready(),
                Err(_) => false,
            }
        })
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Connections established so far.
    pub fn connection_count(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

async fn serve_loop(shared: &Shared, connector: Arc<dyn Connector>) -> RpcResult<()> {
    let mut carried: Vec<Frame> = Vec::new();

    while shared.is_alive() {
        shared.set_state(ConnectionState::Connecting);
        let connected =
            match connect_with_retry(connector.as_ref(), &shared.config.reconnect, &shared.shutdown)
                .await?
            {
                Some(connected) => connected,
                None => break,
            };

        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut conn = Connection::new(connected.transport, epoch, shared.config.max_frame_len);

        shared.set_state(ConnectionState::Authenticating);
        if let Some(identity) = &shared.config.identity {
            debug!(epoch, service = %identity.service, "Queueing handshake");
            conn.enqueue(identity.handshake_request().into());
        }
        conn.mark_ready();
        for frame in carried.drain(..) {
            if !shared.is_withdrawn(&frame) {
                conn.enqueue(frame);
            }
        }
        shared.set_state(ConnectionState::Ready);
        info!(epoch, peer = %connector.describe(), "Connection ready");

        match event_loop::run(shared, conn).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Protocol { error, unsent } => {
                let failed = shared.pending.fail_sent_in(epoch);
                warn!(epoch, failed, carried = unsent.len(), "Protocol error, reconnecting: {}", error);
                carried = unsent;
            }
            SessionEnd::Transport { reason } => {
                warn!(epoch, "Connection lost: {}", reason);
                shared.reset();
            }
        }
        if shared.is_alive() {
            shared.set_state(ConnectionState::Disconnected);
        }
    }

    Ok(())
}
