//! Photo records: a caption and a PNG payload.

use crate::encode::encode_photo_bytes;
use crate::error::{AssetError, AssetResult};
use snapsync_core::{fields, CollectionId, Database, FieldValue, Fields, Record, RecordId, Version};

/// Caption field.
pub const TEXT_FIELD: &str = "text";

/// Encoded image field.
pub const IMAGE_FIELD: &str = "imageData";

/// Builds the fields of a photo record.
///
/// # Errors
///
/// Returns [`AssetError::InvalidPhoto`] for an empty caption.
pub fn photo_fields(text: &str, png: Vec<u8>) -> AssetResult<Fields> {
    if text.is_empty() {
        return Err(AssetError::invalid("caption is empty"));
    }
    Ok(fields([
        (TEXT_FIELD, FieldValue::from(text)),
        (IMAGE_FIELD, FieldValue::Blob(png)),
    ]))
}

/// A photo read back from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    /// Record id.
    pub id: RecordId,
    /// Record version.
    pub version: Version,
    /// Caption.
    pub text: String,
    /// PNG payload, if the record carries one.
    pub image_data: Option<Vec<u8>>,
}

impl Photo {
    /// Reads a photo from a record.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::MissingField`] if the record has no caption.
    pub fn from_record(record: &Record) -> AssetResult<Self> {
        let text = record.text(TEXT_FIELD).ok_or_else(|| AssetError::MissingField {
            id: record.id.clone(),
            field: TEXT_FIELD,
        })?;
        Ok(Self {
            id: record.id.clone(),
            version: record.version,
            text: text.to_string(),
            image_data: record.blob(IMAGE_FIELD).map(<[u8]>::to_vec),
        })
    }
}

/// Encodes `image` and appends a new photo to `collection` in one
/// transaction. Returns the new record id.
///
/// The caption is checked before the image is decoded, so an empty caption
/// costs nothing.
///
/// # Errors
///
/// Returns an error for an empty caption, an undecodable image or a failed
/// log write.
pub fn add_photo(
    db: &Database,
    collection: impl Into<CollectionId>,
    text: &str,
    image: &[u8],
) -> AssetResult<RecordId> {
    if text.is_empty() {
        return Err(AssetError::invalid("caption is empty"));
    }
    let png = encode_photo_bytes(image)?;
    let record = Record::with_generated_id(photo_fields(text, png)?);
    let id = record.id.clone();
    db.collection(collection).append_record(record)?;
    tracing::info!(%id, "added photo");
    Ok(id)
}
