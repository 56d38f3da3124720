//! zlib inflation for compressed binary frames

use crate::error::GatewayError;
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Inflate one zlib-compressed message.
pub fn inflate(frame: &[u8]) -> Result<Vec<u8>, GatewayError> {
    // JSON payloads typically compress 4-8x
    let mut out = Vec::with_capacity(frame.len().saturating_mul(4));
    ZlibDecoder::new(frame)
        .read_to_end(&mut out)
        .map_err(GatewayError::Decompress)?;
    Ok(out)
}
