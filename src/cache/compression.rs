//! Payload framing and compression
//!
//! L2 blobs are frames: one codec tag byte followed by the body. The tag
//! makes every frame self-describing, so toggling `compression` in the
//! config never strands blobs written under the old setting.
//!
//! ```text
//! ┌─────┬──────────────────────────────────────────┐
//! │ tag │ body                                     │
//! │ 0   │ stored bytes                             │
//! │ 1   │ u32 LE decoded length + LZ4 block        │
//! └─────┴──────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::FrameCodec;
//!
//! let codec = FrameCodec::default();
//!
//! let data = "flashcard ".repeat(200);
//! let frame = codec.encode(data.as_bytes());
//! assert!(frame.len() < data.len());
//!
//! let decoded = FrameCodec::decode(&frame).unwrap();
//! assert_eq!(decoded.as_ref(), data.as_bytes());
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{Error, Result};

/// LZ4 never expands a block by more than this factor on decode
const LZ4_MAX_RATIO: u64 = 255;

/// Payloads below this size are stored as-is
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

// =============================================================================
// Codec
// =============================================================================

/// Body encoding named by a frame's tag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Stored,
    Lz4,
}

impl Codec {
    pub fn tag(self) -> u8 {
        match self {
            Codec::Stored => 0,
            Codec::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Codec::Stored),
            1 => Some(Codec::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Codec::Stored => "stored",
            Codec::Lz4 => "lz4",
        })
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// How [`FrameCodec::encode`] picks a codec
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    /// `None` stores every payload uncompressed
    pub codec: Option<Codec>,
    /// Smaller payloads skip compression
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub lz4_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Some(Codec::Lz4),
            threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            lz4_level: 4,
        }
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        Self {
            codec: None,
            ..Self::default()
        }
    }
}

// =============================================================================
// Block codecs
// =============================================================================

/// One body encoding
pub trait BlockCodec: Send + Sync {
    fn codec(&self) -> Codec;

    /// Append the encoded body of `data` to `out`
    fn pack(&self, data: &[u8], out: &mut BytesMut) -> Result<()>;

    /// Decode a body produced by [`BlockCodec::pack`]
    fn unpack(&self, body: &[u8]) -> Result<Bytes>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoredCodec;

impl BlockCodec for StoredCodec {
    fn codec(&self) -> Codec {
        Codec::Stored
    }

    fn pack(&self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        out.put_slice(data);
        Ok(())
    }

    fn unpack(&self, body: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(body))
    }
}

/// LZ4 block format with a little-endian length prefix
#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec {
    level: i32,
}

impl Lz4Codec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Codec {
    fn default() -> Self {
        Self::new(4)
    }
}

impl BlockCodec for Lz4Codec {
    fn codec(&self) -> Codec {
        Codec::Lz4
    }

    fn pack(&self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        let mode = lz4::block::CompressionMode::HIGHCOMPRESSION(self.level);
        let block = lz4::block::compress(data, Some(mode), true).map_err(|e| {
            Error::CompressionFailed {
                algorithm: Codec::Lz4.to_string(),
                reason: e.to_string(),
            }
        })?;
        out.put_slice(&block);
        Ok(())
    }

    fn unpack(&self, body: &[u8]) -> Result<Bytes> {
        check_lz4_prefix(body)?;
        lz4::block::decompress(body, None)
            .map(Bytes::from)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: Codec::Lz4.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Reject length prefixes no block of this size could decode to. A damaged
/// blob must not turn into a multi-gigabyte allocation.
fn check_lz4_prefix(body: &[u8]) -> Result<()> {
    let invalid = |reason: String| Error::DecompressionFailed {
        algorithm: Codec::Lz4.to_string(),
        reason,
    };
    let prefix: [u8; 4] = body
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| invalid("truncated length prefix".into()))?;
    let declared = i32::from_le_bytes(prefix);
    let limit = (body.len() as u64 - 4) * LZ4_MAX_RATIO + 16;
    if declared < 0 || declared as u64 > limit {
        return Err(invalid(format!("implausible decoded length {}", declared)));
    }
    Ok(())
}

// =============================================================================
// Frames
// =============================================================================

/// Writes tagged frames according to a [`CompressionConfig`]
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: CompressionConfig,
}

impl FrameCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Frame `data`, compressing when it is large enough and actually shrinks
    pub fn encode(&self, data: &[u8]) -> Bytes {
        if let Some(codec) = self.config.codec {
            if data.len() >= self.config.threshold_bytes {
                match self.try_encode(codec, data) {
                    Ok(frame) if frame.len() <= data.len() => return frame,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, codec = %codec, "Compression failed, storing payload"),
                }
            }
        }

        let mut frame = BytesMut::with_capacity(data.len() + 1);
        frame.put_u8(Codec::Stored.tag());
        frame.put_slice(data);
        frame.freeze()
    }

    fn try_encode(&self, codec: Codec, data: &[u8]) -> Result<Bytes> {
        let mut frame = BytesMut::with_capacity(data.len() / 2 + 8);
        frame.put_u8(codec.tag());
        block_codec(codec, self.config.lz4_level).pack(data, &mut frame)?;
        Ok(frame.freeze())
    }

    /// Decode a frame written under any configuration
    pub fn decode(frame: &[u8]) -> Result<Bytes> {
        let (&tag, body) = frame.split_first().ok_or_else(|| Error::DecompressionFailed {
            algorithm: "frame".into(),
            reason: "empty payload".into(),
        })?;
        let codec = Codec::from_tag(tag).ok_or_else(|| Error::DecompressionFailed {
            algorithm: "frame".into(),
            reason: format!("unknown codec tag {:#04x}", tag),
        })?;
        block_codec(codec, 0).unpack(body)
    }
}

fn block_codec(codec: Codec, lz4_level: i32) -> Box<dyn BlockCodec> {
    match codec {
        Codec::Stored => Box::new(StoredCodec),
        Codec::Lz4 => Box::new(Lz4Codec::new(lz4_level)),
    }
}
