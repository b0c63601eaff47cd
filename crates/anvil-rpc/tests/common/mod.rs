//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use anvil_rpc::{
    BoxedTransport, Connector, Engine, EngineConfig, Identity, ReconnectPolicy, RpcResult,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LinesCodec};

pub const PIPE_BUFFER: usize = 64 * 1024;
pub const WAIT: Duration = Duration::from_secs(5);

/// Connector that hands out in-memory streams offered by the test.
pub struct PipeConnector {
    streams: flume::Receiver<DuplexStream>,
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        match self.streams.recv_async().await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(_) => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }

    fn describe(&self) -> String {
        "pipe".to_string()
    }
}

/// Test side of a [`PipeConnector`].
pub struct Pipe {
    streams: flume::Sender<DuplexStream>,
}

impl Pipe {
    /// Let the engine connect; returns the peer's end.
    pub fn offer(&self) -> DuplexStream {
        let (engine_end, peer_end) = tokio::io::duplex(PIPE_BUFFER);
        self.streams.send(engine_end).expect("connector dropped");
        peer_end
    }
}

pub fn pipe() -> (Pipe, Arc<PipeConnector>) {
    let (tx, rx) = flume::unbounded();
    (Pipe { streams: tx }, Arc::new(PipeConnector { streams: rx }))
}

/// Connector that always refuses.
pub struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }

    fn describe(&self) -> String {
        "nowhere".to_string()
    }
}

pub fn plugin_config() -> EngineConfig {
    EngineConfig::default()
        .with_identity(Identity::new("test-plugin", "secret"))
        .with_poll_interval(Duration::from_millis(50))
        .with_reconnect(ReconnectPolicy::new(3, Duration::from_millis(20)))
}

pub fn kernel_config() -> EngineConfig {
    EngineConfig::default().with_poll_interval(Duration::from_millis(50))
}

/// Two engines talking over an in-memory link, each on its own I/O thread.
pub struct EnginePair {
    pub plugin: Engine,
    pub kernel: Engine,
    plugin_pipe: Pipe,
    kernel_pipe: Pipe,
    handles: Vec<JoinHandle<RpcResult<()>>>,
}

impl EnginePair {
    /// Build the pair; `setup` binds methods before anything connects.
    pub fn start(setup: impl FnOnce(&Engine, &Engine)) -> Self {
        Self::start_with(plugin_config(), kernel_config(), setup)
    }

    pub fn start_with(
        plugin_config: EngineConfig,
        kernel_config: EngineConfig,
        setup: impl FnOnce(&Engine, &Engine),
    ) -> Self {
        let plugin = Engine::new(plugin_config);
        let kernel = Engine::new(kernel_config);
        setup(&plugin, &kernel);

        let (plugin_pipe, plugin_connector) = pipe();
        let (kernel_pipe, kernel_connector) = pipe();
        let handles = vec![
            plugin.spawn(plugin_connector).expect("spawn plugin"),
            kernel.spawn(kernel_connector).expect("spawn kernel"),
        ];

        let pair = Self {
            plugin,
            kernel,
            plugin_pipe,
            kernel_pipe,
            handles,
        };
        pair.link();
        assert!(pair.plugin.wait_ready(), "plugin never became ready");
        assert!(pair.kernel.wait_ready(), "kernel never became ready");
        pair
    }

    /// Join the two pipes with a fresh stream pair.
    pub fn link(&self) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        self.plugin_pipe.streams.send(a).expect("plugin connector dropped");
        self.kernel_pipe.streams.send(b).expect("kernel connector dropped");
    }
}

impl Drop for EnginePair {
    fn drop(&mut self) {
        self.plugin.close();
        self.kernel.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Raw NDJSON peer used to drive one end of a connection by hand.
pub struct RawPeer {
    lines: Framed<DuplexStream, LinesCodec>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
        }
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("line error");
        serde_json::from_str(&line).expect("engine wrote invalid JSON")
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_line(frame.to_string()).await;
    }

    pub async fn send_line(&mut self, line: impl Into<String>) {
        self.lines.send(line.into()).await.expect("write failed");
    }
}

/// Receive from a flume channel without blocking the test runtime forever.
pub async fn recv_within<T>(rx: &flume::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv_async())
        .await
        .expect("timed out")
        .expect("channel closed")
}
