//! Decoding of raw tile bytes into payloads, and re-encoding of images.

use crate::cache::{ElevationGrid, TilePayload};
use crate::compression::{self, Compression};
use crate::dataset::{ContentKind, Dataset, SampleFormat, TileShape};
use crate::error::DecodeError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;

/// Decodes tile bytes according to the dataset's content kind.
///
/// Input is inflated first when the retriever or the dataset flags it as
/// compressed. Magic-byte sniffing only applies to image datasets: raw
/// elevation samples can start with any byte sequence.
pub fn decode_payload(
    bytes: &Bytes,
    compressed: bool,
    dataset: &Dataset,
) -> Result<TilePayload, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let sniffed = dataset.content == ContentKind::Image
        && Compression::detect(bytes) != Compression::None;
    let data = if compressed || dataset.compressed || sniffed {
        compression::decompress(bytes)?
    } else {
        bytes.clone()
    };

    match dataset.content {
        ContentKind::Image => decode_image(&data).map(TilePayload::Image),
        ContentKind::Elevation(format) => {
            decode_elevation(&data, format, dataset.shape).map(TilePayload::Elevation)
        }
    }
}

/// Decodes any format supported by the `image` crate into RGBA8.
pub fn decode_image(data: &[u8]) -> Result<RgbaImage, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    image::load_from_memory(data)
        .map(|img| img.to_rgba8())
        .map_err(|e| DecodeError::Image(e.to_string()))
}

/// Decodes a little-endian sample grid of exactly `shape` samples.
pub fn decode_elevation(
    data: &[u8],
    format: SampleFormat,
    shape: TileShape,
) -> Result<ElevationGrid, DecodeError> {
    let count = shape.pixels();
    let expected = count * format.bytes_per_sample();
    if data.len() != expected {
        return Err(DecodeError::ElevationShape {
            expected,
            actual: data.len(),
        });
    }

    let samples = match format {
        SampleFormat::Int16 => {
            let mut raw = vec![0i16; count];
            LittleEndian::read_i16_into(data, &mut raw);
            raw.into_iter().map(f32::from).collect()
        }
        SampleFormat::Float32 => {
            let mut raw = vec![0f32; count];
            LittleEndian::read_f32_into(data, &mut raw);
            raw
        }
    };

    Ok(ElevationGrid {
        width: shape.width,
        height: shape.height,
        samples,
    })
}

/// Encodes an image in the format named by `extension`.
///
/// Unknown extensions fall back to PNG. JPEG drops the alpha channel.
pub fn encode_image(image: &RgbaImage, extension: &str) -> Result<Bytes, DecodeError> {
    let format = ImageFormat::from_extension(extension).unwrap_or(ImageFormat::Png);
    let dynamic = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image.clone()).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image.clone()),
    };

    let mut out = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut out, format)
        .map_err(|e| DecodeError::Encode(e.to_string()))?;
    Ok(Bytes::from(out.into_inner()))
}
