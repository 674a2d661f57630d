//! Payload Compression
//!
//! Symmetric codecs applied to outbound diff frames and inbound intent frames.
//! The codec name travels with every frame so both ends can verify they agree.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Default cap on a decompressed payload.
pub const DEFAULT_MAX_DECODED_BYTES: usize = 1024 * 1024;

/// Compression errors.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Nothing to decompress.
    #[error("{0} decompress: empty payload")]
    EmptyPayload(&'static str),

    /// Decoded output exceeded the configured cap.
    #[error("{codec} decompress: output exceeds {limit} bytes")]
    TooLarge {
        /// Codec name
        codec: &'static str,
        /// Configured cap
        limit: usize,
    },

    /// Codec failure (corrupt stream, truncated input).
    #[error("{codec} {op}: {source}")]
    Io {
        /// Codec name
        codec: &'static str,
        /// Operation that failed
        op: &'static str,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// A symmetric payload codec.
pub trait Compressor: Send + Sync {
    /// Codec identifier advertised in frames.
    fn name(&self) -> &'static str;

    /// Encode `data`.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decode `data`. An empty input is always an error, and so is output
    /// larger than the codec's cap.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// Gzip codec (the default).
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
    max_decoded: usize,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            max_decoded: DEFAULT_MAX_DECODED_BYTES,
        }
    }
}

impl GzipCompressor {
    /// Codec name on the wire.
    pub const NAME: &'static str = "gzip";

    /// Gzip with the default compression level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gzip with an explicit level (0-9).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            ..Self::default()
        }
    }

    /// Replace the decompressed size cap.
    pub fn with_max_decoded(mut self, limit: usize) -> Self {
        self.max_decoded = limit;
        self
    }

    /// Decompressed size cap.
    pub fn max_decoded(&self) -> usize {
        self.max_decoded
    }
}

impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let io_err = |op: &'static str| move |source: std::io::Error| CompressionError::Io {
            codec: Self::NAME,
            op,
            source,
        };

        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), self.level);
        encoder.write_all(data).map_err(io_err("write"))?;
        encoder.finish().map_err(io_err("finish"))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Err(CompressionError::EmptyPayload(Self::NAME));
        }

        // One byte past the cap is enough to tell an oversized stream apart
        let mut decoded = Vec::with_capacity((data.len() * 2).min(self.max_decoded));
        GzDecoder::new(data)
            .take(self.max_decoded as u64 + 1)
            .read_to_end(&mut decoded)
            .map_err(|source| CompressionError::Io {
                codec: Self::NAME,
                op: "read",
                source,
            })?;
        if decoded.len() > self.max_decoded {
            return Err(CompressionError::TooLarge {
                codec: Self::NAME,
                limit: self.max_decoded,
            });
        }
        Ok(decoded)
    }
}

// =============================================================================
// TESTS
// =============================================================================
