// zlib-stream frame decoding for the gateway transport.

use flate2::{Decompress, FlushDecompress};
use strand_models::gateway::GatewayMessage;
use thiserror::Error;

/// Trailer of a sync-flushed deflate block; marks the last fragment of a payload.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const INFLATE_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zlib-stream inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),
    #[error("inflate stalled with {0} bytes unread")]
    Stalled(usize),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoder for inbound frames of one connection.
///
/// Binary fragments are accumulated until one ends with [`ZLIB_SUFFIX`], then
/// inflated with a decompressor that lives as long as the connection. A fresh
/// decoder must be used for every new connection.
pub struct FrameDecoder {
    inflater: Decompress,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Parse an uncompressed text frame.
    pub fn decode_text(&self, text: &str) -> Result<GatewayMessage, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Feed one binary fragment. Returns a payload once a complete one is
    /// available. On error the accumulated bytes are discarded.
    pub fn push_binary(&mut self, fragment: &[u8]) -> Result<Option<GatewayMessage>, FrameError> {
        self.buffer.extend_from_slice(fragment);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let compressed = std::mem::take(&mut self.buffer);
        let inflated = self.inflate(&compressed)?;
        Ok(Some(serde_json::from_slice(&inflated)?))
    }

    /// Bytes buffered while waiting for the final fragment.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut output = Vec::with_capacity(input.len().saturating_mul(4).max(INFLATE_CHUNK));
        let mut offset = 0;

        loop {
            if output.len() == output.capacity() {
                output.reserve(INFLATE_CHUNK);
            }
            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            self.inflater
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            offset += consumed;

            let output_full = output.len() == output.capacity();
            if offset >= input.len() && !output_full {
                break;
            }
            if consumed == 0 && produced == 0 && !output_full {
                return Err(FrameError::Stalled(input.len() - offset));
            }
        }

        Ok(output)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
