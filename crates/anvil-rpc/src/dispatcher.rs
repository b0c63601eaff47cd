//! Outbound request construction and inbound frame routing

use anvil_protocol::{
    CorrelationId, Frame, Identity, Request, Response, Target, HANDSHAKE_METHOD,
};
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::{RpcError, RpcResult};
use crate::pending::Callbacks;
use crate::registry::CallArgs;

/// Queue a request for the I/O thread.
///
/// A correlation id is allocated only when `callbacks` is given, and the
/// pending entry exists before the frame can reach the wire. Fails with
/// [`RpcError::ConnectionClosed`] if the engine is already closed; in that
/// case the callbacks never run.
pub(crate) fn dispatch(
    shared: &Shared,
    target: Target,
    method: String,
    args: CallArgs,
    callbacks: Option<Callbacks>,
) -> RpcResult<Option<CorrelationId>> {
    if !shared.is_alive() {
        return Err(RpcError::ConnectionClosed);
    }

    let id = callbacks.map(|callbacks| {
        let id = shared.next_correlation_id();
        shared.pending.register(id, callbacks);
        id
    });

    debug!(%method, id = ?id.map(|id| id.0), "Queueing request");
    let frame = Frame::Request(Request {
        target: Some(target),
        method,
        args: args.args,
        kwargs: args.kwargs,
        id,
    });
    shared.enqueue(frame);

    // close() may have drained the table between the check above and the
    // registration; make sure this entry does not outlive the engine.
    if !shared.is_alive() {
        if let Some(id) = id {
            shared.pending.resolve(id, Err(RpcError::ConnectionClosed));
        }
    }

    Ok(id)
}

/// Route one decoded frame. Returns the response owed to the peer, if any.
pub(crate) fn handle_inbound(shared: &Shared, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Request(req) => handle_request(shared, req).map(Frame::Response),
        Frame::Response(resp) => {
            handle_response(shared, resp);
            None
        }
    }
}

fn handle_request(shared: &Shared, req: Request) -> Option<Response> {
    debug!(method = %req.method, id = ?req.id.map(|id| id.0), "Inbound request");

    if req.method == HANDSHAKE_METHOD && !shared.registry.contains(HANDSHAKE_METHOD) {
        match Identity::from_handshake(&req.kwargs) {
            Some(identity) => info!(
                service = %identity.service,
                instance = ?identity.instance,
                "Peer identified"
            ),
            None => warn!("Handshake without a service name"),
        }
        return req.id.map(|id| Response::success(id, serde_json::Value::Null));
    }

    let args = CallArgs {
        args: req.args,
        kwargs: req.kwargs,
    };
    let outcome = shared.registry.invoke(&req.method, args);

    // Fire-and-forget: the outcome is only logged (by the registry).
    let id = req.id?;
    Some(Response::from_outcome(id, outcome))
}

fn handle_response(shared: &Shared, resp: Response) {
    let id = resp.id;
    let outcome = resp.into_outcome().map_err(RpcError::Remote);
    if !shared.pending.resolve(id, outcome) {
        warn!(%id, "Dropping response for unknown correlation id");
    }
}
