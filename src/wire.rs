//! Length-prefixed RPC frame codec.
//!
//! Wire layout, in order:
//!
//! ```text
//! u32 (LE) header_len | header (JSON, exactly 3 fields) | args (header.args_size bytes)
//! ```
//!
//! The decoder is incremental: feed it bytes as they arrive and poll for
//! complete frames. Responses are deliberately *not* framed: the
//! provider serializes, writes, and closes, and the consumer performs a
//! single bounded read (see `rpc::channel`).

use serde::{Deserialize, Serialize};

/// Frames whose header claims more than this are rejected outright.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// The three-field envelope in front of every request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    pub service_name: String,
    pub method_name: String,
    pub args_size: u32,
}

/// Framing violations. Every variant closes the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame header length {0} exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLarge(usize),
    #[error("frame header does not parse: {0}")]
    HeaderDecode(#[source] serde_json::Error),
    #[error("frame header does not serialize: {0}")]
    HeaderEncode(#[source] serde_json::Error),
    #[error("frame truncated: needed {expected} more bytes at end of stream")]
    Truncated { expected: usize },
}

/// Assemble a complete frame for `service.method` carrying `args`.
pub fn encode_frame(service: &str, method: &str, args: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header = RpcHeader {
        service_name: service.to_string(),
        method_name: method.to_string(),
        args_size: args.len() as u32,
    };
    let header_bytes = serde_json::to_vec(&header).map_err(FrameError::HeaderEncode)?;
    let mut frame = Vec::with_capacity(4 + header_bytes.len() + args.len());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(args);
    Ok(frame)
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to pop one complete frame. `Ok(None)` means more bytes are
    /// needed.
    pub fn try_next(&mut self) -> Result<Option<(RpcHeader, Vec<u8>)>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let header_len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLarge(header_len));
        }
        if self.buf.len() < 4 + header_len {
            return Ok(None);
        }
        let header: RpcHeader =
            serde_json::from_slice(&self.buf[4..4 + header_len]).map_err(FrameError::HeaderDecode)?;
        let args_size = header.args_size as usize;
        let total = 4 + header_len + args_size;
        if self.buf.len() < total {
            return Ok(None);
        }
        let args = self.buf[4 + header_len..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header, args)))
    }

    /// Call at end of stream: leftover bytes mean the peer hung up
    /// mid-frame.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            // How many more bytes the current partial frame still needs,
            // when that is knowable.
            let expected = if self.buf.len() < 4 {
                4 - self.buf.len()
            } else {
                let header_len =
                    u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
                (4 + header_len).saturating_sub(self.buf.len()).max(1)
            };
            Err(FrameError::Truncated { expected })
        }
    }
}
