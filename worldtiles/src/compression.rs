//! Detection and inflation of compressed tile bodies.
//!
//! Two container formats are recognised: gzip streams and single-entry zip
//! archives (the first local file entry is extracted).

use crate::error::DecodeError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_LOCAL_HEADER: u32 = 0x0403_4b50;
const ZIP_HEADER_LEN: usize = 30;
const ZIP_METHOD_STORED: u16 = 0;
const ZIP_METHOD_DEFLATE: u16 = 8;

/// Compression container of a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zip,
}

impl Compression {
    /// Sniffs the container from leading magic bytes.
    pub fn detect(data: &[u8]) -> Self {
        if data.len() >= 2 && data[..2] == GZIP_MAGIC {
            Compression::Gzip
        } else if data.len() >= 4 && LittleEndian::read_u32(&data[..4]) == ZIP_LOCAL_HEADER {
            Compression::Zip
        } else {
            Compression::None
        }
    }

    /// Maps a `Content-Encoding` or `Content-Type` header value.
    pub fn from_header(value: &str) -> Self {
        let value = value.to_ascii_lowercase();
        if value.contains("gzip") {
            Compression::Gzip
        } else if value.contains("zip") {
            Compression::Zip
        } else {
            Compression::None
        }
    }
}

/// Inflates `data` according to its detected container.
///
/// Uncompressed input is returned unchanged.
pub fn decompress(data: &Bytes) -> Result<Bytes, DecodeError> {
    match Compression::detect(data) {
        Compression::None => Ok(data.clone()),
        Compression::Gzip => decompress_gzip(data),
        Compression::Zip => decompress_zip(data),
    }
}

pub fn decompress_gzip(data: &[u8]) -> Result<Bytes, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress(format!("gzip: {}", e)))?;
    Ok(Bytes::from(out))
}

/// Extracts the first entry of a zip archive.
pub fn decompress_zip(data: &[u8]) -> Result<Bytes, DecodeError> {
    if data.len() < ZIP_HEADER_LEN || LittleEndian::read_u32(&data[..4]) != ZIP_LOCAL_HEADER {
        return Err(DecodeError::Decompress("zip: missing local file header".into()));
    }

    let method = LittleEndian::read_u16(&data[8..10]);
    let compressed_size = LittleEndian::read_u32(&data[18..22]) as usize;
    let name_len = LittleEndian::read_u16(&data[26..28]) as usize;
    let extra_len = LittleEndian::read_u16(&data[28..30]) as usize;

    let start = ZIP_HEADER_LEN + name_len + extra_len;
    if start > data.len() {
        return Err(DecodeError::Decompress("zip: truncated header".into()));
    }
    // Streamed deflate entries record a zero size; the deflate stream is
    // self-terminating. A stored entry of size zero is empty.
    let end = if compressed_size == 0 && method == ZIP_METHOD_DEFLATE {
        data.len()
    } else {
        start
            .checked_add(compressed_size)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| DecodeError::Decompress("zip: truncated entry".into()))?
    };
    let entry = &data[start..end];

    match method {
        ZIP_METHOD_STORED => Ok(Bytes::copy_from_slice(entry)),
        ZIP_METHOD_DEFLATE => {
            let mut out = Vec::new();
            DeflateDecoder::new(entry)
                .read_to_end(&mut out)
                .map_err(|e| DecodeError::Decompress(format!("zip: {}", e)))?;
            Ok(Bytes::from(out))
        }
        other => Err(DecodeError::Decompress(format!(
            "zip: unsupported compression method {}",
            other
        ))),
    }
}
