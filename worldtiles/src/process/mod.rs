//! Post-processing of retrieved tile bytes.
//!
//! ```text
//! RetrievalResult ──► decode ──► transforms ──► DiskCache ──► TileCache
//!                        ▲
//!   mask result ─────────┘ (masked datasets, via MaskJoin)
//! ```

pub mod decode;
pub mod mask;
pub mod processor;
pub mod transform;

pub use decode::{decode_elevation, decode_image, decode_payload, encode_image};
pub use mask::{join_pair, JoinHalf, MaskJoin};
pub use processor::{DownloadPostProcessor, ProcessJob};
pub use transform::{apply_transforms, color_key_to_alpha, compose_mask, ImageTransform};
