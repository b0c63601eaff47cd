//! Transports, connect/retry, and per-connection state
//!
//! A [`Connector`] produces a fresh byte stream each time the engine needs a
//! connection. [`connect_with_retry`] applies the [`ReconnectPolicy`], and a
//! [`Connection`] wraps the resulting stream with the frame codec and the
//! connection's own outbound queue.

use anvil_protocol::{
    CodecError, CorrelationId, Frame, FrameCodec, RemoteError, Request, Response, RESPONSE_TOO_LARGE,
};
use async_trait::async_trait;
use futures::SinkExt;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::RpcError;

/// Any bidirectional byte stream the engine can speak over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Source of connections.
///
/// `connect` is called once per connection attempt; a connection-refused
/// error is retried according to the engine's [`ReconnectPolicy`], any other
/// error is fatal.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxedTransport>;

    /// Human readable peer description for logs.
    fn describe(&self) -> String;
}

/// Connects to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        match tokio::net::UnixStream::connect(&self.path).await {
            Ok(stream) => Ok(Box::new(stream)),
            // No socket file yet means nobody is listening; retry like a refusal.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, e))
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(not(unix))]
#[derive(Debug, Clone)]
pub struct Unsupported {
    what: String,
}

#[cfg(not(unix))]
impl Unsupported {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

#[cfg(not(unix))]
#[async_trait]
impl Connector for Unsupported {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} is not supported on this platform", self.what),
        ))
    }

    fn describe(&self) -> String {
        self.what.clone()
    }
}

/// Accepting side: every "connect" waits for the next peer on the listener.
///
/// This lets a kernel run the same engine as its plugins.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: std::net::TcpListener,
}

impl TcpAcceptor {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Connector for TcpAcceptor {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        let listener = tokio::net::TcpListener::from_std(self.listener.try_clone()?)?;
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "Accepted connection");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("listen://{}", addr),
            Err(_) => "listen://?".to_string(),
        }
    }
}

/// Accepting side over a Unix socket. The socket file is replaced on bind
/// and removed on drop.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixAcceptor {
    path: std::path::PathBuf,
    listener: std::os::unix::net::UnixListener,
}

#[cfg(unix)]
impl UnixAcceptor {
    pub fn bind(path: impl Into<std::path::PathBuf>) -> io::Result<Self> {
        let path = path.into();
        anvil_protocol::prepare_socket(&path)?;
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixAcceptor {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        let listener = tokio::net::UnixListener::from_std(self.listener.try_clone()?)?;
        let (stream, _) = listener.accept().await?;
        info!(path = %self.path.display(), "Accepted connection");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("listen:unix:{}", self.path.display())
    }
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = anvil_protocol::remove_socket(&self.path);
    }
}

/// Result of a successful [`connect_with_retry`].
pub struct Connected {
    pub transport: BoxedTransport,
    /// Delays slept before the attempt that succeeded.
    pub retries: u32,
}

/// Connect, retrying connection-refused up to `policy.max_retries` times.
///
/// Returns `Ok(None)` if `cancel` fires first. Exhausting the retries yields
/// [`RpcError::ConnectFailed`]; any other connect error yields
/// [`RpcError::Connect`] without retrying.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Result<Option<Connected>, RpcError> {
    let peer = connector.describe();
    let mut retries = 0;

    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            attempt = connector.connect() => attempt,
        };

        match attempt {
            Ok(transport) => {
                info!(%peer, retries, "Connected");
                return Ok(Some(Connected { transport, retries }));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if retries >= policy.max_retries {
                    return Err(RpcError::ConnectFailed {
                        attempts: retries + 1,
                        source: e,
                    });
                }
                retries += 1;
                debug!(%peer, retries, "Connection refused, retrying in {:?}", policy.delay());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(policy.delay()) => {}
                }
            }
            Err(e) => {
                warn!(%peer, "Connect failed: {}", e);
                return Err(RpcError::Connect(e));
            }
        }
    }
}

/// One live connection: its epoch, framed halves, and outbound queue.
pub(crate) struct Connection {
    pub(crate) epoch: u64,
    pub(crate) reader: FramedRead<ReadHalf<BoxedTransport>, FrameCodec>,
    writer: FramedWrite<WriteHalf<BoxedTransport>, FrameCodec>,
    queue: VecDeque<Frame>,
    ready: bool,
}

impl Connection {
    pub(crate) fn new(transport: BoxedTransport, epoch: u64, max_frame_len: usize) -> Self {
        let (read, write) = tokio::io::split(transport);
        Self {
            epoch,
            reader: FramedRead::new(read, FrameCodec::with_max_len(max_frame_len)),
            writer: FramedWrite::new(write, FrameCodec::with_max_len(max_frame_len)),
            queue: VecDeque::new(),
            ready: false,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub(crate) fn enqueue(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Write every queued frame in order, then flush.
    ///
    /// `on_sent` runs for each frame once it has been handed to the sink, so
    /// the caller can record which requests reached this epoch. Frames over
    /// the length limit never reach the wire: an oversized response is
    /// replaced by a `ResponseTooLarge` failure, and the ids of oversized
    /// requests are returned so their calls can be failed.
    pub(crate) async fn flush_queue<F>(
        &mut self,
        mut on_sent: F,
    ) -> Result<Vec<CorrelationId>, CodecError>
    where
        F: FnMut(&Frame),
    {
        let mut rejected = Vec::new();
        while let Some(frame) = self.queue.pop_front() {
            match self.writer.feed(frame.clone()).await {
                Ok(()) => on_sent(&frame),
                Err(CodecError::LineTooLong { max }) => {
                    warn!(epoch = self.epoch, kind = frame.kind(), max, "Oversized outbound frame");
                    match frame {
                        Frame::Request(Request { id: Some(id), .. }) => rejected.push(id),
                        Frame::Request(_) => {}
                        Frame::Response(resp) => self.feed_too_large(resp.id, max).await?,
                    }
                }
                Err(e) => {
                    self.queue.push_front(frame);
                    return Err(e);
                }
            }
        }
        self.writer.flush().await?;
        Ok(rejected)
    }

    async fn feed_too_large(&mut self, id: CorrelationId, max: usize) -> Result<(), CodecError> {
        let error = RemoteError::new(
            RESPONSE_TOO_LARGE,
            format!("Result exceeds the {} byte frame limit", max),
        );
        match self.writer.feed(Frame::from(Response::failure(id, error))).await {
            Err(CodecError::LineTooLong { .. }) => {
                warn!(epoch = self.epoch, %id, "Frame limit too small for an error response");
                Ok(())
            }
            other => other,
        }
    }

    /// Queued requests that never reached the wire, in order.
    pub(crate) fn into_unsent_requests(self) -> Vec<Frame> {
        self.queue
            .into_iter()
            .filter(|frame| matches!(frame, Frame::Request(_)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Refuses the first `refusals` attempts, then hands out an in-memory stream.
    struct FlakyConnector {
        refusals: u32,
        attempts: Arc<AtomicU32>,
        error: io::ErrorKind,
    }

    impl FlakyConnector {
        fn refusing(refusals: u32) -> Self {
            Self {
                refusals,
                attempts: Arc::new(AtomicU32::new(0)),
                error: io::ErrorKind::ConnectionRefused,
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> io::Result<BoxedTransport> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.refusals {
                return Err(io::Error::from(self.error));
            }
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(12, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_refusals_then_success() {
        let connector = FlakyConnector::refusing(12);
        let start = tokio::time::Instant::now();

        let connected = connect_with_retry(&connector, &policy(), &CancellationToken::new())
            .await
            .unwrap()
            .expect("not cancelled");

        assert_eq!(connected.retries, 12);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 13);
        assert!(start.elapsed() <= Duration::from_secs(5 * 12));
        assert!(start.elapsed() >= Duration::from_secs(5 * 12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_fatal() {
        let connector = FlakyConnector::refusing(u32::MAX);

        let err = connect_with_retry(&connector, &policy(), &CancellationToken::new())
            .await
            .err()
            .expect("should fail");

        assert!(matches!(err, RpcError::ConnectFailed { attempts: 13, .. }));
        assert!(err.is_fatal());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let mut connector = FlakyConnector::refusing(1);
        connector.error = io::ErrorKind::PermissionDenied;

        let err = connect_with_retry(&connector, &policy(), &CancellationToken::new())
            .await
            .err()
            .expect("should fail");

        assert!(matches!(err, RpcError::Connect(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_retry_delay() {
        let connector = FlakyConnector::refusing(u32::MAX);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            canceller.cancel();
        });

        let result = connect_with_retry(&connector, &policy(), &cancel).await.unwrap();
        assert!(result.is_none());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_preserves_order_and_reports_sent() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut conn = Connection::new(Box::new(ours), 1, 1024);
        for method in ["a", "b", "c"] {
            conn.enqueue(Frame::from(Request::new(method)));
        }

        let mut sent = Vec::new();
        conn.flush_queue(|f| sent.push(f.kind())).await.unwrap();
        assert_eq!(sent, vec!["request"; 3]);
        assert!(!conn.has_queued());

        let mut peer = FramedRead::new(theirs, FrameCodec::new());
        for expected in ["a", "b", "c"] {
            match peer.next().await.unwrap().unwrap().unwrap() {
                Frame::Request(req) => assert_eq!(req.method, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_not_sent() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut conn = Connection::new(Box::new(ours), 1, 64);
        let mut big = Request::new("x".repeat(200));
        big.id = Some(CorrelationId(4));
        conn.enqueue(Frame::from(big));
        conn.enqueue(Frame::from(Request::new("y".repeat(200))));
        conn.enqueue(Frame::from(Request::new("small")));

        let mut sent = 0;
        let rejected = conn.flush_queue(|_| sent += 1).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(rejected, vec![CorrelationId(4)]);

        let mut peer = FramedRead::new(theirs, FrameCodec::new());
        match peer.next().await.unwrap().unwrap().unwrap() {
            Frame::Request(req) => assert_eq!(req.method, "small"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_failure() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut conn = Connection::new(Box::new(ours), 1, 256);
        conn.enqueue(Frame::from(Response::success(CorrelationId(5), "z".repeat(1000))));

        let rejected = conn.flush_queue(|_| {}).await.unwrap();
        assert!(rejected.is_empty());

        let mut peer = FramedRead::new(theirs, FrameCodec::new());
        match peer.next().await.unwrap().unwrap().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.id, CorrelationId(5));
                assert_eq!(resp.into_outcome().unwrap_err().kind, RESPONSE_TOO_LARGE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_acceptor_pairs_with_connector() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("kernel.sock");
        let acceptor = UnixAcceptor::bind(path.clone()).unwrap();
        let connector = UnixConnector::new(path.clone());

        let (accepted, connected) = tokio::join!(acceptor.connect(), connector.connect());
        let mut accepted = accepted.unwrap();
        let mut connected = connected.unwrap();
        connected.write_all(b"hi\n").await.unwrap();
        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");

        drop(acceptor);
        assert!(!path.exists());
    }

    #[test]
    fn test_unsent_requests_skip_responses() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let mut conn = Connection::new(Box::new(ours), 3, 1024);
        conn.enqueue(Frame::from(Request::new("keep")));
        conn.enqueue(Frame::from(Response::success(CorrelationId(1), 1)));

        let unsent = conn.into_unsent_requests();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].kind(), "request");
    }
}
