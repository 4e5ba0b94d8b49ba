//! Log header: compaction point, acknowledged watermark, remote cursor.

use crate::error::{CoreError, CoreResult};
use crate::log::frame::{compute_crc32, read_u64};
use crate::types::SequenceNumber;

const HEADER_MAGIC: [u8; 4] = *b"SNHD";
const HEADER_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 8 + 8 + 8 + 4;

/// Persistent bookkeeping stored next to the log.
///
/// ```text
/// | magic (4) | version (2) | last_compacted (8) | ack_watermark (8) | remote_cursor (8) | crc32 (4) |
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogHeader {
    /// Highest sequence number folded into the snapshot and dropped from
    /// the log.
    pub last_compacted: SequenceNumber,
    /// Highest local sequence number the remote authority acknowledged.
    pub ack_watermark: SequenceNumber,
    /// Highest remote-authority sequence number ingested.
    pub remote_cursor: u64,
}

impl LogHeader {
    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.last_compacted.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.ack_watermark.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.remote_cursor.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses a header. An empty buffer is a fresh log.
    ///
    /// # Errors
    ///
    /// Returns an error for a short buffer, bad magic, unknown version or a
    /// checksum mismatch.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() != HEADER_SIZE {
            return Err(CoreError::invalid_format(format!(
                "log header is {} bytes, expected {HEADER_SIZE}",
                bytes.len()
            )));
        }
        if bytes[0..4] != HEADER_MAGIC {
            return Err(CoreError::invalid_format("bad log header magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != HEADER_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported log header version {version}"
            )));
        }

        let (body, stored) = bytes.split_at(HEADER_SIZE - 4);
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            last_compacted: SequenceNumber::new(read_u64(&bytes[6..14])),
            ack_watermark: SequenceNumber::new(read_u64(&bytes[14..22])),
            remote_cursor: read_u64(&bytes[22..30]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_fresh() {
        assert_eq!(LogHeader::decode(&[]).unwrap(), LogHeader::default());
    }

    #[test]
    fn encode_decode() {
        let header = LogHeader {
            last_compacted: SequenceNumber::new(3),
            ack_watermark: SequenceNumber::new(9),
            remote_cursor: 41,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(LogHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn damaged_header_is_rejected() {
        let mut bytes = LogHeader::default().encode();
        bytes[10] ^= 1;
        assert!(matches!(
            LogHeader::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(LogHeader::decode(&bytes[..12]).is_err());
    }
}
