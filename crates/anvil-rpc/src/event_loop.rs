//! The I/O loop driving one connection

use anvil_protocol::{CodecError, Frame, Request};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dispatcher;
use crate::engine::Shared;
use crate::error::RpcError;

/// Why a connection's loop ended.
pub(crate) enum SessionEnd {
    /// `close()` was called.
    Shutdown,
    /// The codec reported a stream-level fault. `unsent` holds requests that
    /// were queued on the connection but never written.
    Protocol { error: CodecError, unsent: Vec<Frame> },
    /// EOF, reset, or a failed write.
    Transport { reason: String },
}

/// Move a frame from the outbox onto the connection, unless its call was
/// already failed or withdrawn.
fn admit(shared: &Shared, conn: &mut Connection, frame: Frame) {
    if shared.is_withdrawn(&frame) {
        debug!(epoch = conn.epoch, "Discarding request for a settled call");
        return;
    }
    conn.enqueue(frame);
}

/// Serve `conn` until it ends.
///
/// Frames are written whenever the connection queue is non-empty, always as
/// a full in-order drain, so per-connection send order is FIFO. Inbound
/// requests are handled inline; a slow handler holds up everything else.
pub(crate) async fn run(shared: &Shared, mut conn: Connection) -> SessionEnd {
    let epoch = conn.epoch;
    let mut watchdog = tokio::time::interval(shared.config.poll_interval());
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if conn.has_queued() {
            let pending = &shared.pending;
            let flushed = conn
                .flush_queue(|frame| {
                    if let Frame::Request(Request { id: Some(id), .. }) = frame {
                        pending.mark_sent(*id, epoch);
                    }
                })
                .await;
            match flushed {
                Ok(rejected) => {
                    let max = shared.config.max_frame_len;
                    for id in rejected {
                        shared.pending.resolve(id, Err(RpcError::FrameTooLarge { max }));
                    }
                }
                Err(e) => {
                    return SessionEnd::Transport {
                        reason: format!("write failed: {}", e),
                    };
                }
            }
        }

        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => return SessionEnd::Shutdown,

            inbound = conn.reader.next() => match inbound {
                None => {
                    return SessionEnd::Transport {
                        reason: "peer closed the connection".to_string(),
                    };
                }
                Some(Err(error)) if error.is_protocol() => {
                    return SessionEnd::Protocol {
                        error,
                        unsent: conn.into_unsent_requests(),
                    };
                }
                Some(Err(error)) => {
                    return SessionEnd::Transport {
                        reason: error.to_string(),
                    };
                }
                Some(Ok(Err(error))) => {
                    warn!(epoch, "Dropping malformed frame: {}", error);
                }
                Some(Ok(Ok(frame))) => {
                    if let Some(reply) = dispatcher::handle_inbound(shared, frame) {
                        conn.enqueue(reply);
                    }
                }
            },

            outbound = shared.outbox.recv_async(), if conn.is_ready() => match outbound {
                Ok(frame) => {
                    admit(shared, &mut conn, frame);
                    // Batch whatever else is already waiting into this drain.
                    while let Ok(frame) = shared.outbox.try_recv() {
                        admit(shared, &mut conn, frame);
                    }
                }
                Err(_) => return SessionEnd::Shutdown,
            },

            _ = watchdog.tick() => {
                if !shared.is_alive() {
                    debug!(epoch, "Engine no longer alive");
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}
