//! Journal frame encoding.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! | magic "SDJ1" (4) | payload length u32 (4) | payload (n) | crc32 (4) |
//! ```
//!
//! The CRC covers the magic, the length and the payload.

use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every journal frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SDJ1";

/// Magic + length.
const HEADER_SIZE: usize = 8;

/// Trailing CRC.
const CRC_SIZE: usize = 4;

/// Largest payload a frame can carry (4-byte length field).
pub const MAX_RECORD_SIZE: usize = u32::MAX as usize;

/// Result of scanning a journal image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replay {
    /// Intact records in append order.
    pub records: Vec<Vec<u8>>,
    /// Length of the intact prefix; anything after it is a torn tail.
    pub valid_len: u64,
}

impl Replay {
    /// Returns true if the scanned image ended with a torn tail.
    #[must_use]
    pub fn has_torn_tail(&self, image_len: usize) -> bool {
        self.valid_len < image_len as u64
    }
}

/// Encodes one record as a frame.
///
/// # Errors
///
/// Returns [`StorageError::RecordTooLarge`] if the record exceeds
/// [`MAX_RECORD_SIZE`].
pub fn encode_frame(record: &[u8]) -> StorageResult<Vec<u8>> {
    if record.len() > MAX_RECORD_SIZE {
        return Err(StorageError::RecordTooLarge {
            size: record.len(),
            max: MAX_RECORD_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + record.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    // Safe: length validated above
    frame.extend_from_slice(&(record.len() as u32).to_le_bytes());
    frame.extend_from_slice(record);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Scans a journal image and returns every intact record.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] when a damaged frame is followed by
/// more data, which a crash during append cannot produce.
pub fn decode_frames(image: &[u8]) -> StorageResult<Replay> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < image.len() {
        let remaining = &image[pos..];

        if remaining.len() < HEADER_SIZE {
            break;
        }

        if remaining[..4] != FRAME_MAGIC {
            // Some filesystems zero-fill the tail after a crash.
            if remaining.iter().all(|b| *b == 0) {
                break;
            }
            return Err(StorageError::corrupted(pos as u64, "invalid frame magic"));
        }

        let payload_len =
            u32::from_le_bytes([remaining[4], remaining[5], remaining[6], remaining[7]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if remaining.len() < total_len {
            break;
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            remaining[payload_end],
            remaining[payload_end + 1],
            remaining[payload_end + 2],
            remaining[payload_end + 3],
        ]);
        let computed_crc = compute_crc32(&remaining[..payload_end]);

        if stored_crc != computed_crc {
            if pos + total_len == image.len() {
                break;
            }
            return Err(StorageError::corrupted(
                pos as u64,
                format!("checksum mismatch: stored {stored_crc:08x}, computed {computed_crc:08x}"),
            ));
        }

        records.push(remaining[HEADER_SIZE..payload_end].to_vec());
        pos += total_len;
    }

    Ok(Replay {
        records,
        valid_len: pos as u64,
    })
}

/// Computes a CRC-32 (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}
