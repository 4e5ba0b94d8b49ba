//! Log entry framing.

use crate::error::{CoreError, CoreResult};
use crate::mutation::{LogEntry, Mutation};
use crate::types::{Origin, SequenceNumber};
use snapsync_storage::StorageBackend;

/// Magic bytes opening every frame.
pub const LOG_MAGIC: [u8; 4] = *b"SNLG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + origin (1) + sequence (8) + length (4).
pub(crate) const FRAME_HEADER_SIZE: usize = 19;

const CRC_SIZE: usize = 4;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + CRC_SIZE;

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 == 1 { (c >> 1) ^ 0xEDB8_8320 } else { c >> 1 };
            bit += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// CRC32 (IEEE 802.3, reflected) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        CRC_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8)
    })
}

/// Builds the complete frame for one entry.
pub(crate) fn encode_frame(
    sequence: SequenceNumber,
    origin: Origin,
    mutation: &Mutation,
) -> CoreResult<Vec<u8>> {
    let payload = mutation.encode()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("mutation larger than 4 GiB"))?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.push(origin.as_byte());
    frame.extend_from_slice(&sequence.as_u64().to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Reads the frame starting at `offset`.
///
/// Returns `Ok(None)` when the remaining bytes cannot hold the whole frame,
/// which recovery treats as a torn tail. A short frame followed by a
/// complete, checksummed frame is a damaged length prefix instead, and is
/// reported as corruption. The second tuple element is the frame length.
pub(crate) fn read_frame(
    backend: &dyn StorageBackend,
    offset: u64,
    size: u64,
) -> CoreResult<Option<(LogEntry, u64)>> {
    match parse_frame(backend, offset, size)? {
        Some(frame) => Ok(Some(frame)),
        None if complete_frame_after(backend, offset + 1, size)? => Err(
            CoreError::log_corruption(offset, "frame length runs past a later complete frame"),
        ),
        None => Ok(None),
    }
}

/// Looks for a complete frame starting anywhere in `from..size`.
fn complete_frame_after(backend: &dyn StorageBackend, from: u64, size: u64) -> CoreResult<bool> {
    if size.saturating_sub(from) < FRAME_OVERHEAD as u64 {
        return Ok(false);
    }
    let len = usize::try_from(size - from)
        .map_err(|_| CoreError::log_corruption(from, "log too large for this platform"))?;
    let tail = backend.read_at(from, len)?;
    let candidates = tail
        .windows(LOG_MAGIC.len())
        .enumerate()
        .filter(|(_, window)| *window == LOG_MAGIC)
        .map(|(pos, _)| from + pos as u64);
    for candidate in candidates {
        if let Ok(Some(_)) = parse_frame(backend, candidate, size) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_frame(
    backend: &dyn StorageBackend,
    offset: u64,
    size: u64,
) -> CoreResult<Option<(LogEntry, u64)>> {
    let remaining = size.saturating_sub(offset);
    if remaining < FRAME_HEADER_SIZE as u64 {
        return Ok(None);
    }

    let head = backend.read_at(offset, FRAME_HEADER_SIZE)?;
    if head[0..4] != LOG_MAGIC {
        return Err(CoreError::log_corruption(offset, "bad frame magic"));
    }
    let version = u16::from_le_bytes([head[4], head[5]]);
    if version != LOG_VERSION {
        return Err(CoreError::log_corruption(
            offset,
            format!("unsupported frame version {version}"),
        ));
    }
    let origin = Origin::from_byte(head[6])
        .ok_or_else(|| CoreError::log_corruption(offset, format!("unknown origin {:#04x}", head[6])))?;
    let sequence = SequenceNumber::new(read_u64(&head[7..15]));
    let len = u64::from(u32::from_le_bytes([head[15], head[16], head[17], head[18]]));

    let frame_len = FRAME_OVERHEAD as u64 + len;
    if remaining < frame_len {
        return Ok(None);
    }

    let body_len = usize::try_from(len + CRC_SIZE as u64)
        .map_err(|_| CoreError::log_corruption(offset, "frame too large for this platform"))?;
    let body = backend.read_at(offset + FRAME_HEADER_SIZE as u64, body_len)?;
    let (payload, stored) = body.split_at(body_len - CRC_SIZE);

    let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let mut covered = head;
    covered.extend_from_slice(payload);
    let actual = compute_crc32(&covered);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }

    let mutation = Mutation::decode(payload).map_err(|e| {
        CoreError::log_corruption(offset, format!("undecodable payload: {e}"))
    })?;
    Ok(Some((LogEntry::new(sequence, origin, mutation), frame_len)))
}

pub(crate) fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
