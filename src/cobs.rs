//! Consistent Overhead Byte Stuffing: eliminates 0x00 from a payload so it can serve as an
//! unambiguous frame delimiter on the wire. The caller is responsible for appending (encode)
//! or having already stripped (decode) the trailing 0x00 delimiter byte itself.

use thiserror::Error;

/// Maximum number of data bytes a single COBS block may carry before a new block is opened.
const MAX_BLOCK_LEN: usize = 254;

/// Bound on how many undelimited bytes [`Deframer`] will buffer before giving up on the frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CobsError {
    #[error("empty input")]
    EmptyInput,
    #[error("leading code byte is zero")]
    ZeroCodeByte,
    #[error("block length exceeds remaining bytes")]
    BlockTooLong,
    #[error("embedded zero byte inside a block")]
    EmbeddedZero,
}

/// Stuff `data` into a COBS frame. Never contains 0x00. Empty input encodes to `[0x01]`.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / MAX_BLOCK_LEN + 2);
    let mut code_pos = 0usize;
    out.push(0); // placeholder, patched below
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_pos] = code;
            code_pos = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code as usize == MAX_BLOCK_LEN + 1 {
                out[code_pos] = code;
                code_pos = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_pos] = code;
    out
}

/// Destuff a COBS frame (no trailing delimiter) back into the original payload.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CobsError> {
    if data.is_empty() {
        return Err(CobsError::EmptyInput);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        if code == 0 {
            return Err(CobsError::ZeroCodeByte);
        }
        let block_len = (code - 1) as usize;
        i += 1;

        if i + block_len > data.len() {
            return Err(CobsError::BlockTooLong);
        }
        for &b in &data[i..i + block_len] {
            if b == 0 {
                return Err(CobsError::EmbeddedZero);
            }
            out.push(b);
        }
        i += block_len;

        // A full (0xFF) block never implies a trailing zero, even mid-frame.
        if code as usize != MAX_BLOCK_LEN + 1 && i < data.len() {
            out.push(0);
        }
    }
    Ok(out)
}

/// Accumulates bytes off a serial stream until a 0x00 delimiter, then yields the stuffed
/// body for decoding. Resets on decode failure, disconnect, and on overflowing
/// [`MAX_FRAME_LEN`] without ever seeing a delimiter.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feed one byte. Returns `Some(stuffed_body)` once a delimiter closes a frame; the
    /// caller should pass that slice to [`decode`] and call [`Self::reset`] on failure.
    pub fn push_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == 0x00 {
            let frame = std::mem::take(&mut self.buf);
            return Some(frame);
        }

        self.buf.push(byte);
        if self.buf.len() > MAX_FRAME_LEN {
            tracing::warn!(len = self.buf.len(), "COBS frame overflowed bound, resetting");
            self.reset();
        }
        None
    }

    /// Feed a chunk of bytes, returning every complete stuffed frame found within it.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if let Some(frame) = self.push_byte(b) {
                frames.push(frame);
            }
        }
        frames
    }
}
