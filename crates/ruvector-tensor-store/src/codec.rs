//! Chunk compression codecs
//!
//! A chunk is always encoded as a whole before it reaches the backing
//! store and decoded as a whole after it is read back. Adding a codec
//! means adding a [`Compressor`] variant; call sites only ever use
//! [`Compressor::encode`] and [`Compressor::decode`].

use crate::error::{Result, TensorStoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compression level settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fast compression (lower ratio)
    #[default]
    Fast,
    /// Balanced compression
    Balanced,
    /// Best compression (slower)
    Best,
}

impl CompressionLevel {
    fn zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Codec applied to a chunk's bytes at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compressor {
    /// Raw bytes
    None,
    /// LZ4 block format with prepended length
    Lz4,
    /// Zstandard frame
    Zstd {
        /// zstd compression level
        level: i32,
    },
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Lz4
    }
}

impl Compressor {
    /// Zstandard at the given level preset.
    pub fn zstd(level: CompressionLevel) -> Self {
        Compressor::Zstd {
            level: level.zstd_level(),
        }
    }

    /// Encode a full chunk.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compressor::Zstd { level } => zstd::encode_all(data, *level)
                .map_err(|e| TensorStoreError::Codec(format!("Zstd error: {}", e))),
        }
    }

    /// Decode a full chunk, checking it has the declared uncompressed length.
    pub fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let decoded = match self {
            Compressor::None => data.to_vec(),
            Compressor::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| TensorStoreError::Codec(format!("LZ4 error: {}", e)))?,
            Compressor::Zstd { .. } => zstd::decode_all(data)
                .map_err(|e| TensorStoreError::Codec(format!("Zstd error: {}", e)))?,
        };

        if decoded.len() != expected_len {
            return Err(TensorStoreError::Codec(format!(
                "decoded chunk has {} bytes, expected {}",
                decoded.len(),
                expected_len
            )));
        }
        Ok(decoded)
    }

    /// Short codec name.
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Lz4 => "lz4",
            Compressor::Zstd { .. } => "zstd",
        }
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compressor::Zstd { level } => write!(f, "zstd(level={})", level),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Compressor {
    type Err = TensorStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(Compressor::None),
            "lz4" | "default" => Ok(Compressor::Lz4),
            "zstd" => Ok(Compressor::zstd(CompressionLevel::Fast)),
            _ => Err(TensorStoreError::Unsupported(format!(
                "Wrong compressor: {}, only LZ4 and ZSTD are supported",
                s
            ))),
        }
    }
}
