//! Distributed Tier Value Codec
//!
//! Values crossing the process boundary are serialized to JSON and framed with
//! a one-byte header:
//!
//! ```text
//! +------+---------------------------------------------+
//! | 0x00 | raw serialized bytes                        |
//! | 0x01 | LZ4 block (original size prefixed) of above |
//! +------+---------------------------------------------+
//! ```
//!
//! Compression is attempted only above the configured threshold and kept only
//! when it actually shrinks the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CompressionConfig;
use crate::error::{Error, Result};

/// Header for an uncompressed frame
pub const FRAME_RAW: u8 = 0x00;
/// Header for an LZ4-compressed frame
pub const FRAME_LZ4: u8 = 0x01;

/// Frame encoding actually used for a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Raw,
    Lz4,
}

impl FrameKind {
    fn header(self) -> u8 {
        match self {
            FrameKind::Raw => FRAME_RAW,
            FrameKind::Lz4 => FRAME_LZ4,
        }
    }
}

/// Serializer/compressor for distributed-tier values
#[derive(Debug, Clone)]
pub struct ValueCodec {
    enabled: bool,
    threshold: usize,
    level: i32,
}

impl ValueCodec {
    /// Build a codec from compression settings
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold_bytes,
            level: config.level,
        }
    }

    /// Serialize a value to its JSON bytes
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Deserialize JSON bytes into a value
    pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Frame serialized bytes for the distributed tier
    pub fn encode(&self, serialized: &[u8]) -> (Bytes, FrameKind) {
        let kind_and_body = if self.enabled && serialized.len() > self.threshold {
            match self.compress(serialized) {
                Ok(compressed) if compressed.len() < serialized.len() => {
                    Some((FrameKind::Lz4, compressed))
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Compression failed, storing uncompressed");
                    None
                }
            }
        } else {
            None
        };

        let (kind, body): (FrameKind, &[u8]) = match &kind_and_body {
            Some((kind, compressed)) => (*kind, compressed.as_slice()),
            None => (FrameKind::Raw, serialized),
        };

        let mut frame = BytesMut::with_capacity(body.len() + 1);
        frame.put_u8(kind.header());
        frame.put_slice(body);
        (frame.freeze(), kind)
    }

    /// Unwrap a frame back to serialized bytes
    pub fn decode(&self, frame: &[u8]) -> Result<Bytes> {
        let (&header, body) = frame
            .split_first()
            .ok_or_else(|| Error::InvalidFrame("empty frame".into()))?;

        match header {
            FRAME_RAW => Ok(Bytes::copy_from_slice(body)),
            FRAME_LZ4 => lz4::block::decompress(body, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: e.to_string(),
                }),
            other => Err(Error::InvalidFrame(format!("unknown header 0x{other:02x}"))),
        }
    }

    /// Serialize and frame in one step
    pub fn encode_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<(Bytes, Bytes)> {
        let serialized = Self::serialize(value)?;
        let (frame, _) = self.encode(&serialized);
        Ok((serialized, frame))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(&CompressionConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
