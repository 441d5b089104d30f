// SPDX-License-Identifier: Apache-2.0
//! Length-prefixed JSON framing for the streaming channel.
//!
//! A frame is `len (u32, BE)` followed by exactly `len` bytes of JSON. The
//! decode side works off an accumulator so a reader can feed partial socket
//! reads and drain complete frames as they arrive.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Hard ceiling on one frame's payload. A full game log replacement fits
/// comfortably; anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Framing and codec failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared payload length exceeds [`MAX_FRAME_BYTES`].
    #[error("frame payload too large: {0} bytes")]
    TooLarge(usize),
    /// Payload bytes were not a valid message.
    #[error("frame decode failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Encode a message into one length-prefixed frame.
///
/// # Errors
///
/// [`FrameError::TooLarge`] when the encoded payload exceeds the ceiling;
/// [`FrameError::Codec`] on JSON encoding failure.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Drain one complete frame from the front of `acc`, if present.
///
/// Returns `Ok(None)` when more bytes are needed; the accumulator is left
/// untouched in that case (and on the too-large error, so the caller can
/// drop the connection without a partial drain).
///
/// # Errors
///
/// [`FrameError::TooLarge`] when the declared length exceeds the ceiling;
/// [`FrameError::Codec`] when a complete payload fails to parse (the frame
/// is consumed).
pub fn try_decode_frame<T: DeserializeOwned>(acc: &mut Vec<u8>) -> Result<Option<T>, FrameError> {
    if acc.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([acc[0], acc[1], acc[2], acc[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    if acc.len() < 4 + len {
        return Ok(None);
    }
    let frame: Vec<u8> = acc.drain(..4 + len).collect();
    let msg = serde_json::from_slice(&frame[4..])?;
    Ok(Some(msg))
}
