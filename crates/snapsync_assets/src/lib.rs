//! # Snapsync Assets
//!
//! Photo payloads for Snapsync records.
//!
//! This crate provides:
//! - A deterministic 0.5× linear downscale followed by PNG encoding
//! - Photo record helpers (`text` caption, `imageData` payload)
//! - A two-tier decoded asset cache that follows record versions

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod encode;
mod error;
mod photo;

pub use cache::{AssetCache, CacheStats};
pub use encode::{decode_asset, encode_photo, encode_photo_bytes, scaled_dimensions, PHOTO_SCALE};
pub use error::{AssetError, AssetResult};
pub use photo::{add_photo, photo_fields, Photo, IMAGE_FIELD, TEXT_FIELD};
