//! Pixel transforms applied to decoded image tiles.
//!
//! Datasets configure an ordered list of [`ImageTransform`]s; each one takes
//! the image produced by the previous step.

use crate::dataset::TileShape;
use crate::error::DecodeError;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use std::fmt;

/// One step of the image transform pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTransform {
    /// Makes pixels within `tolerance` (per channel) of `color` transparent.
    ColorKey { color: [u8; 3], tolerance: u8 },
    /// Resamples the image to the given shape.
    Resize(TileShape),
}

impl ImageTransform {
    pub fn apply(&self, image: RgbaImage) -> RgbaImage {
        match self {
            ImageTransform::ColorKey { color, tolerance } => {
                let mut image = image;
                color_key_to_alpha(&mut image, *color, *tolerance);
                image
            }
            ImageTransform::Resize(shape) => {
                if image.dimensions() == (shape.width, shape.height) {
                    image
                } else {
                    imageops::resize(&image, shape.width, shape.height, FilterType::Triangle)
                }
            }
        }
    }

    /// Whether the transform can introduce transparency.
    pub fn produces_alpha(&self) -> bool {
        matches!(self, ImageTransform::ColorKey { .. })
    }
}

impl fmt::Display for ImageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageTransform::ColorKey { color, tolerance } => write!(
                f,
                "color_key(#{:02x}{:02x}{:02x}, ±{})",
                color[0], color[1], color[2], tolerance
            ),
            ImageTransform::Resize(shape) => write!(f, "resize({})", shape),
        }
    }
}

/// Runs `transforms` in order.
pub fn apply_transforms(image: RgbaImage, transforms: &[ImageTransform]) -> RgbaImage {
    transforms
        .iter()
        .fold(image, |image, transform| transform.apply(image))
}

/// Sets alpha to zero for every pixel whose RGB channels are each within
/// `tolerance` of `color`.
pub fn color_key_to_alpha(image: &mut RgbaImage, color: [u8; 3], tolerance: u8) {
    for pixel in image.pixels_mut() {
        let matches = pixel.0[..3]
            .iter()
            .zip(color.iter())
            .all(|(channel, key)| channel.abs_diff(*key) <= tolerance);
        if matches {
            pixel.0[3] = 0;
        }
    }
}

/// Multiplies the image's alpha by the mask's luminance.
///
/// A white mask pixel keeps the pixel's alpha, black makes it transparent.
pub fn compose_mask(image: &mut RgbaImage, mask: &GrayImage) -> Result<(), DecodeError> {
    if image.dimensions() != mask.dimensions() {
        let (width, height) = image.dimensions();
        let (mask_width, mask_height) = mask.dimensions();
        return Err(DecodeError::MaskShape {
            width,
            height,
            mask_width,
            mask_height,
        });
    }

    for (pixel, luma) in image.pixels_mut().zip(mask.pixels()) {
        let alpha = pixel.0[3] as u16 * luma.0[0] as u16 / 255;
        pixel.0[3] = alpha as u8;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    #[test]
    fn test_color_key_exact_and_tolerance() {
        let mut img = RgbaImage::from_pixel(3, 1, Rgba([0, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([3, 2, 1, 255]));
        img.put_pixel(2, 0, Rgba([10, 0, 0, 255]));

        color_key_to_alpha(&mut img, [0, 0, 0], 3);
        assert_eq!(img.get_pixel(0, 0)[3], 0);
        assert_eq!(img.get_pixel(1, 0)[3], 0);
        assert_eq!(img.get_pixel(2, 0)[3], 255);
    }

    #[test]
    fn test_resize() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 4]));
        let out = ImageTransform::Resize(TileShape::new(4, 2)).apply(img);
        assert_eq!(out.dimensions(), (4, 2));
    }

    #[test]
    fn test_pipeline_order() {
        // Keying before resizing: the whole tile is keyed out.
        let img = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        let out = apply_transforms(
            img,
            &[
                ImageTransform::ColorKey {
                    color: [255, 255, 255],
                    tolerance: 0,
                },
                ImageTransform::Resize(TileShape::new(2, 2)),
            ],
        );
        assert_eq!(out.dimensions(), (2, 2));
        assert!(out.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_compose_mask_scales_alpha() {
        let mut img = RgbaImage::from_pixel(2, 1, Rgba([9, 9, 9, 200]));
        let mut mask = GrayImage::new(2, 1);
        mask.put_pixel(0, 0, Luma([255]));
        mask.put_pixel(1, 0, Luma([0]));

        compose_mask(&mut img, &mask).unwrap();
        assert_eq!(img.get_pixel(0, 0)[3], 200);
        assert_eq!(img.get_pixel(1, 0)[3], 0);
        assert_eq!(img.get_pixel(1, 0)[0], 9);
    }

    #[test]
    fn test_compose_mask_dimension_mismatch() {
        let mut img = RgbaImage::new(4, 4);
        let mask = GrayImage::new(2, 2);
        assert!(matches!(
            compose_mask(&mut img, &mask),
            Err(DecodeError::MaskShape { mask_width: 2, .. })
        ));
    }

    #[test]
    fn test_display() {
        let t = ImageTransform::ColorKey {
            color: [0xff, 0, 0x10],
            tolerance: 2,
        };
        assert_eq!(t.to_string(), "color_key(#ff0010, ±2)");
        assert!(t.produces_alpha());
        assert!(!ImageTransform::Resize(TileShape::new(1, 1)).produces_alpha());
    }
}
