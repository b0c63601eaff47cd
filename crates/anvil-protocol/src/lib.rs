//! Wire types shared by both ends of an anvil connection.
//!
//! A connection carries [`Frame`]s: requests (optionally correlated) and
//! responses. [`FrameCodec`] puts them on a byte stream as one JSON document
//! per line.

mod codec;
mod lifecycle;
mod protocol;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use lifecycle::{prepare_socket, remove_socket, socket_path};
pub use protocol::{
    CorrelationId, Frame, Identity, RemoteError, Request, Response, Target, DEFAULT_NODE,
    HANDLER_ERROR, HANDSHAKE_METHOD, INVALID_ARGUMENTS, METHOD_NOT_FOUND, PANIC,
    RESPONSE_TOO_LARGE,
};
