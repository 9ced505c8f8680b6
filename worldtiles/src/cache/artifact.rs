//! Decoded tile artifacts held by the memory cache.

use crate::coord::TileKey;
use crate::retrieval::Validators;
use image::RgbaImage;
use std::sync::Arc;
use std::time::SystemTime;

/// Row-major grid of elevation samples, south-west origin as delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<f32>,
}

impl ElevationGrid {
    /// Sample at `(x, y)`, or `None` when out of range.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Minimum and maximum sample, ignoring NaN.
    pub fn range(&self) -> Option<(f32, f32)> {
        self.samples
            .iter()
            .copied()
            .filter(|s| !s.is_nan())
            .fold(None, |acc, s| match acc {
                None => Some((s, s)),
                Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
            })
    }
}

/// Decoded tile content.
#[derive(Debug, Clone)]
pub enum TilePayload {
    Image(RgbaImage),
    Elevation(ElevationGrid),
}

impl TilePayload {
    /// Bytes of decoded data held in memory.
    pub fn byte_size(&self) -> usize {
        match self {
            TilePayload::Image(img) => img.as_raw().len(),
            TilePayload::Elevation(grid) => grid.samples.len() * std::mem::size_of::<f32>(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            TilePayload::Image(img) => img.dimensions(),
            TilePayload::Elevation(grid) => (grid.width, grid.height),
        }
    }

    pub fn as_image(&self) -> Option<&RgbaImage> {
        match self {
            TilePayload::Image(img) => Some(img),
            TilePayload::Elevation(_) => None,
        }
    }

    pub fn as_elevation(&self) -> Option<&ElevationGrid> {
        match self {
            TilePayload::Elevation(grid) => Some(grid),
            TilePayload::Image(_) => None,
        }
    }
}

/// A decoded tile ready for the renderer.
///
/// Artifacts are immutable once built; refreshing one produces a new
/// artifact sharing the same payload.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub key: TileKey,
    pub payload: Arc<TilePayload>,
    pub byte_size: usize,
    /// Submission generation that produced this artifact.
    pub generation: u64,
    pub validators: Validators,
    /// When the content was last confirmed current.
    pub stored_at: SystemTime,
}

impl CachedArtifact {
    pub fn new(key: TileKey, payload: TilePayload, generation: u64, validators: Validators) -> Self {
        let byte_size = payload.byte_size();
        Self {
            key,
            payload: Arc::new(payload),
            byte_size,
            generation,
            validators,
            stored_at: SystemTime::now(),
        }
    }

    /// Copy confirmed current by a newer generation; the payload is shared.
    pub fn refreshed(&self, generation: u64) -> Self {
        Self {
            generation,
            stored_at: SystemTime::now(),
            ..self.clone()
        }
    }

    /// Whether the artifact predates `expiry`.
    pub fn is_stale(&self, expiry: Option<SystemTime>) -> bool {
        expiry.is_some_and(|expiry| self.stored_at <= expiry)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.payload.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn artifact() -> CachedArtifact {
        CachedArtifact::new(
            TileKey::new("t", 0, 0, 0),
            TilePayload::Image(RgbaImage::new(4, 2)),
            1,
            Validators::default(),
        )
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(artifact().byte_size, 4 * 2 * 4);
        let grid = TilePayload::Elevation(ElevationGrid {
            width: 3,
            height: 3,
            samples: vec![0.0; 9],
        });
        assert_eq!(grid.byte_size(), 36);
    }

    #[test]
    fn test_refreshed_shares_payload() {
        let a = artifact();
        let b = a.refreshed(7);
        assert!(Arc::ptr_eq(&a.payload, &b.payload));
        assert_eq!(b.generation, 7);
        assert!(b.stored_at >= a.stored_at);
    }

    #[test]
    fn test_staleness() {
        let a = artifact();
        assert!(!a.is_stale(None));
        assert!(a.is_stale(Some(a.stored_at + Duration::from_secs(1))));
        assert!(!a.is_stale(Some(a.stored_at - Duration::from_secs(1))));
    }

    #[test]
    fn test_elevation_accessors() {
        let grid = ElevationGrid {
            width: 2,
            height: 2,
            samples: vec![1.0, f32::NAN, -3.0, 8.0],
        };
        assert_eq!(grid.get(0, 1), Some(-3.0));
        assert_eq!(grid.get(2, 0), None);
        assert_eq!(grid.range(), Some((-3.0, 8.0)));
    }
}
