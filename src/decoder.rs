//! Tile decoding for JPEG format.
//!
//! Uses zune-jpeg for fast SIMD-accelerated decoding.

use bytes::Bytes;
use zune_jpeg::JpegDecoder;

use crate::error::{EngineError, EngineResult};

/// Decoded tile data: packed RGB, no row padding (`width*3` == stride).
#[derive(Debug, Clone)]
pub struct TileData {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl TileData {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Size in bytes, used for L1 cache weighting.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Compressed JPEG tile data, as read from the pack (not yet decoded).
#[derive(Debug, Clone)]
pub struct CompressedTileData {
    pub jpeg_bytes: Bytes,
}

impl CompressedTileData {
    pub fn new(jpeg_bytes: Bytes) -> Self {
        Self { jpeg_bytes }
    }

    /// Size in bytes, used for L2 cache weighting.
    pub fn size_bytes(&self) -> usize {
        self.jpeg_bytes.len()
    }
}

/// Decode compressed JPEG bytes to packed RGB pixel data.
///
/// Handles grayscale-to-RGB expansion. Dimensions come from the JPEG
/// header, not the nominal tile size — edge tiles may be smaller.
pub fn decode_jpeg_bytes(compressed: &CompressedTileData) -> EngineResult<TileData> {
    let mut decoder = JpegDecoder::new(compressed.jpeg_bytes.as_ref());

    let pixels = decoder
        .decode()
        .map_err(|e| EngineError::DecodeError(format!("failed to decode JPEG: {:?}", e)))?;

    let info = decoder
        .info()
        .ok_or_else(|| EngineError::DecodeError("failed to get image info".into()))?;

    let width = info.width as u32;
    let height = info.height as u32;

    let rgb_data = if info.components == 1 {
        pixels.iter().flat_map(|&gray| [gray, gray, gray]).collect()
    } else {
        pixels
    };

    Ok(TileData::new(rgb_data, width, height))
}
