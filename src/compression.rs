//! Compression support for stored documents

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Default zstd level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression applied to a table's encoded documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd {
        #[serde(default = "default_level")]
        level: i32,
    },
    Lz4,
}

fn default_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

impl Compression {
    pub fn zstd() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Compress data
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { level } => {
                let mut encoder = zstd::Encoder::new(Vec::new(), *level).map_err(|e| {
                    Error::Compression(format!("Failed to create zstd encoder: {}", e))
                })?;
                encoder
                    .write_all(data)
                    .map_err(|e| Error::Compression(format!("Failed to compress: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(format!("Failed to finish compression: {}", e)))
            }
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { .. } => zstd::decode_all(data)
                .map_err(|e| Error::Compression(format!("Failed to decompress: {}", e))),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Compression(format!("LZ4 decompression failed: {}", e))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd { .. } => "zstd",
            Compression::Lz4 => "lz4",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    /// Accepts `none`, `lz4`, `zstd` or `zstd:<level>`
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.split_once(':') {
            Some(("zstd", level)) => level
                .parse()
                .map(|level| Compression::Zstd { level })
                .map_err(|_| Error::Config(format!("Invalid zstd level: {}", level))),
            Some(_) => Err(Error::Config(format!("Unknown compression: {}", s))),
            None => match lower.as_str() {
                "none" => Ok(Compression::None),
                "zstd" => Ok(Compression::zstd()),
                "lz4" => Ok(Compression::Lz4),
                _ => Err(Error::Config(format!("Unknown compression: {}", s))),
            },
        }
    }
}

/// Compression statistics
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new(original_size: usize, compressed_size: usize) -> Self {
        let ratio = if original_size > 0 {
            compressed_size as f64 / original_size as f64
        } else {
            1.0
        };
        Self {
            original_size,
            compressed_size,
            ratio,
        }
    }

    /// Calculate space saved (percentage)
    pub fn space_saved_percent(&self) -> f64 {
        (1.0 - self.ratio) * 100.0
    }
}
