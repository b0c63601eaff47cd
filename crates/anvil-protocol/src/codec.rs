//! Newline-delimited JSON framing.
//!
//! Each frame is one JSON document on its own line. Framing errors (a line
//! longer than the configured limit, bytes that are not UTF-8) poison the
//! stream; a well-delimited line that is not a valid frame does not, and is
//! handed to the caller as an inner `Err` so it can be logged and skipped.

use crate::protocol::Frame;
use bytes::BytesMut;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound on a single encoded frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CodecError {
    /// Stream-level protocol fault, as opposed to a transport failure.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::LineTooLong { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::InvalidData,
            Self::Encode(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn lift(&self, err: LinesCodecError) -> CodecError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::LineTooLong { max: self.max_len },
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn parse(line: String) -> Option<Result<Frame, serde_json::Error>> {
        if line.trim().is_empty() {
            return None;
        }
        Some(serde_json::from_str(&line))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, serde_json::Error>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src).map_err(|e| self.lift(e))? {
                Some(line) => {
                    if let Some(item) = Self::parse(line) {
                        return Ok(Some(item));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src).map_err(|e| self.lift(e))? {
                Some(line) => {
                    if let Some(item) = Self::parse(line) {
                        return Ok(Some(item));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&frame)?;
        if json.len() > self.max_len {
            return Err(CodecError::LineTooLong { max: self.max_len });
        }
        self.lines.encode(json, dst).map_err(|e| self.lift(e))
    }
}
