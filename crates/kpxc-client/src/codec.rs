//! Proxy stdio framing
//!
//! Every message is a 4-byte little-endian length followed by that many bytes
//! of UTF-8 JSON, the browser native-messaging layout `keepassxc-proxy` uses.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const HEADER_LEN: usize = 4;
/// Native messaging caps host messages at 1 MiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("Received JSON-data is invalid. JSON-Error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental decoder over whatever the proxy has written so far.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw buffer for `read_buf`-style producers.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns `None` until a whole frame is buffered.
    ///
    /// An oversized length header cannot be resynchronised, so the buffer is
    /// dropped along with the error. A frame with a bad body is consumed and
    /// decoding continues with the next one.
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            self.buf.clear();
            return Some(Err(FrameError::TooLarge(len)));
        }
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len);
        Some(serde_json::from_slice(&body).map_err(FrameError::from))
    }
}
