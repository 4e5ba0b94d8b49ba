//! Records and their field values.

use crate::types::{RecordId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field name to value mapping of a record.
pub type Fields = BTreeMap<String, FieldValue>;

/// A scalar or binary field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit absence.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Opaque payload such as an encoded image, versioned with its record.
    Blob(#[serde(with = "blob")] Vec<u8>),
}

impl FieldValue {
    /// Returns the text if this is a `Text` value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the bytes if this is a `Blob` value.
    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Integer` value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Short type name used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Blob(bytes)
    }
}

/// A uniquely identified, versioned object.
///
/// The object store keeps records behind `Arc` and never mutates one in
/// place; every change installs a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Immutable identifier.
    pub id: RecordId,
    /// Version, strictly increasing per id.
    pub version: Version,
    /// Field values.
    pub fields: Fields,
    /// Tombstone flag.
    pub deleted: bool,
}

impl Record {
    /// Creates a live record at [`Version::INITIAL`].
    pub fn new(id: impl Into<RecordId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            version: Version::INITIAL,
            fields,
            deleted: false,
        }
    }

    /// Creates a live record with a generated id.
    #[must_use]
    pub fn with_generated_id(fields: Fields) -> Self {
        Self::new(RecordId::generate(), fields)
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns a text field.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_text)
    }

    /// Returns a blob field.
    #[must_use]
    pub fn blob(&self, name: &str) -> Option<&[u8]> {
        self.field(name).and_then(FieldValue::as_blob)
    }

    /// Returns `true` unless the record is a tombstone.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Builds a [`Fields`] map from `(name, value)` pairs.
///
/// ```rust
/// use snapsync_core::{fields, FieldValue};
///
/// let f = fields([("text", FieldValue::from("Cat"))]);
/// assert_eq!(f["text"].as_text(), Some("Cat"));
/// ```
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, FieldValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// CBOR byte strings for blobs instead of integer arrays.
mod blob {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(BlobVisitor)
    }

    struct BlobVisitor;

    impl<'de> Visitor<'de> for BlobVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_live_at_initial_version() {
        let record = Record::new("p1", fields([("text", "Cat".into())]));
        assert_eq!(record.version, Version::INITIAL);
        assert!(record.is_live());
        assert_eq!(record.text("text"), Some("Cat"));
        assert_eq!(record.blob("text"), None);
    }

    #[test]
    fn blob_is_encoded_as_byte_string() {
        let value = FieldValue::Blob(vec![0x89, b'P', b'N', b'G']);
        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).unwrap();
        // Major type 2 (byte string) of length 4 follows the variant name.
        assert!(buf.windows(5).any(|w| w == [0x44, 0x89, b'P', b'N', b'G']));

        let decoded: FieldValue = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn field_kinds() {
        assert_eq!(FieldValue::Null.kind(), "null");
        assert_eq!(FieldValue::from(3_i64).as_integer(), Some(3));
        assert_eq!(FieldValue::from(true).kind(), "bool");
    }
}
