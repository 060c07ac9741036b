//! Zlib codec for cache values stored in Redis. Values below the threshold
//! are stored raw; a one-byte envelope marker tells the two apart.

use std::io::Write;
use std::sync::RwLock;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use tracing::debug;

use crate::utils::errors::{QueueError, QueueResult};

const MARKER_RAW: u8 = 0;
const MARKER_ZLIB: u8 = 1;

#[derive(Debug, Default, Clone)]
pub struct CompressionMetrics {
    pub compressions: u64,
    pub decompressions: u64,
    pub original_bytes: u64,
    pub stored_bytes: u64,
}

impl CompressionMetrics {
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.stored_bytes as f64 / self.original_bytes as f64
        }
    }
}

pub struct CompressionCodec {
    threshold: usize,
    level: u32,
    metrics: RwLock<CompressionMetrics>,
}

impl CompressionCodec {
    pub fn new(threshold: usize, level: u32) -> Self {
        Self {
            threshold,
            level: level.min(9),
            metrics: RwLock::new(CompressionMetrics::default()),
        }
    }

    /// Wraps `data` in the storage envelope, compressing when it is both
    /// large enough and actually shrinks.
    pub fn encode(&self, data: &[u8]) -> QueueResult<Vec<u8>> {
        if data.len() < self.threshold {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(MARKER_RAW);
            out.extend_from_slice(data);
            return Ok(out);
        }

        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2 + 1),
            Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| QueueError::Serialization(format!("compression failed: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| QueueError::Serialization(format!("compression failed: {}", e)))?;

        if compressed.len() + 1 >= data.len() {
            debug!("value did not shrink ({} bytes), storing raw", data.len());
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(MARKER_RAW);
            out.extend_from_slice(data);
            return Ok(out);
        }

        if let Ok(mut metrics) = self.metrics.write() {
            metrics.compressions += 1;
            metrics.original_bytes += data.len() as u64;
            metrics.stored_bytes += compressed.len() as u64;
        }

        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(MARKER_ZLIB);
        out.extend(compressed);
        Ok(out)
    }

    pub fn decode(&self, stored: &[u8]) -> QueueResult<Vec<u8>> {
        let (marker, body) = stored
            .split_first()
            .ok_or_else(|| QueueError::Serialization("empty cache envelope".into()))?;
        match *marker {
            MARKER_RAW => Ok(body.to_vec()),
            MARKER_ZLIB => {
                let mut decoder = ZlibDecoder::new(Vec::new());
                decoder
                    .write_all(body)
                    .map_err(|e| QueueError::Serialization(format!("decompression failed: {}", e)))?;
                let out = decoder
                    .finish()
                    .map_err(|e| QueueError::Serialization(format!("decompression failed: {}", e)))?;
                if let Ok(mut metrics) = self.metrics.write() {
                    metrics.decompressions += 1;
                }
                Ok(out)
            }
            other => Err(QueueError::Serialization(format!(
                "unknown cache envelope marker {}",
                other
            ))),
        }
    }

    pub fn metrics(&self) -> CompressionMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_stay_raw() {
        let codec = CompressionCodec::new(1024, 6);
        let stored = codec.encode(b"tiny").unwrap();
        assert_eq!(stored[0], MARKER_RAW);
        assert_eq!(codec.decode(&stored).unwrap(), b"tiny");
    }

    #[test]
    fn large_values_compress_and_round_trip() {
        let codec = CompressionCodec::new(64, 6);
        let data = "the same sentence over and over ".repeat(100);
        let stored = codec.encode(data.as_bytes()).unwrap();
        assert_eq!(stored[0], MARKER_ZLIB);
        assert!(stored.len() < data.len());
        assert_eq!(codec.decode(&stored).unwrap(), data.as_bytes());
        assert!(codec.metrics().ratio() < 1.0);
    }

    #[test]
    fn incompressible_values_fall_back_to_raw() {
        let codec = CompressionCodec::new(8, 6);
        let data: Vec<u8> = (0..=255).collect();
        let stored = codec.encode(&data).unwrap();
        // Random-ish bytes do not shrink; marker says raw.
        assert_eq!(stored[0], MARKER_RAW);
        assert_eq!(codec.decode(&stored).unwrap(), data);
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let codec = CompressionCodec::new(1024, 6);
        assert!(codec.decode(&[9, 1, 2, 3]).is_err());
        assert!(codec.decode(&[]).is_err());
    }
}
