// SPDX-License-Identifier: PMPL-1.0-or-later
//
// TSDB Write-Ahead Log - Record framing
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Binary framing for log records and for the per-segment offset index.
//
// Record frame (all integers little-endian):
//   [4 bytes: frame_length (u32)]   -- length of everything after this field
//   [4 bytes: crc32 checksum]       -- CRC32 of all bytes after this field
//   [8 bytes: version (i64)]
//   [1 byte:  record_type]
//   [4 bytes: payload_len (u32)]
//   [N bytes: payload]
//
// Index entry (one per record, in version order):
//   [8 bytes: version (i64)]
//   [8 bytes: frame offset in the log file (u64)]

use crc32fast::Hasher as Crc32Hasher;
use thiserror::Error;

use crate::version::Version;

/// Maximum payload size: 64 MiB.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the CRC32 field.
pub const CRC_SIZE: usize = 4;

/// Size of the fixed fields covered by the CRC (version + type + payload_len).
pub const FIXED_FIELDS_SIZE: usize = 8 + 1 + 4;

/// Size of one offset index entry.
pub const INDEX_ENTRY_SIZE: u64 = 16;

const MIN_FRAME_LENGTH: usize = CRC_SIZE + FIXED_FIELDS_SIZE;
const MAX_FRAME_LENGTH: usize = MIN_FRAME_LENGTH + MAX_RECORD_SIZE;

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes are available than the frame declares; typical of a crash
    /// mid-write at the end of a segment.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the frame requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The declared frame length is outside the legal range.
    #[error("frame declares invalid length {0}")]
    BadLength(u32),

    /// The stored checksum does not match the frame contents.
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC32 stored in the frame.
        stored: u32,
        /// CRC32 computed over the frame contents.
        computed: u32,
    },

    /// The payload length field disagrees with the frame length.
    #[error("payload length {declared} does not fit frame of {frame_length} bytes")]
    PayloadMismatch {
        /// Payload length stored in the frame.
        declared: u32,
        /// Frame length stored in the prefix.
        frame_length: u32,
    },
}

/// A single record in the write-ahead log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalRecord {
    /// The record's position in the log.
    pub version: Version,

    /// Caller-defined category tag.
    pub record_type: u8,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Creates a record.
    pub fn new(version: Version, record_type: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            record_type,
            payload: payload.into(),
        }
    }

    /// Length of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Serialize this record to its on-disk frame.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.version, self.record_type, &self.payload)
    }

    /// Decode the frame at the start of `data` into `self`, reusing the
    /// payload allocation. Returns the number of bytes consumed.
    pub fn decode_from(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        let (frame_end, inner) = split_frame(data)?;

        self.version = read_i64(&inner[0..8]);
        self.record_type = inner[8];
        self.payload.clear();
        self.payload.extend_from_slice(&inner[FIXED_FIELDS_SIZE..]);

        Ok(frame_end)
    }

    /// Decode a fresh record from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        let mut record = Self::default();
        let consumed = record.decode_from(data)?;
        Ok((record, consumed))
    }
}

/// Total on-disk size of a frame carrying `payload_len` payload bytes.
pub fn frame_len(payload_len: usize) -> usize {
    LENGTH_PREFIX_SIZE + CRC_SIZE + FIXED_FIELDS_SIZE + payload_len
}

/// Build the on-disk frame for a record without copying it into a
/// `WalRecord` first.
pub fn encode_frame(version: Version, record_type: u8, payload: &[u8]) -> Vec<u8> {
    let frame_length = (CRC_SIZE + FIXED_FIELDS_SIZE + payload.len()) as u32;
    let mut buffer = Vec::with_capacity(frame_len(payload.len()));

    buffer.extend_from_slice(&frame_length.to_le_bytes());
    // CRC placeholder, patched once the covered bytes are in place.
    buffer.extend_from_slice(&[0u8; CRC_SIZE]);
    buffer.extend_from_slice(&version.to_le_bytes());
    buffer.push(record_type);
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(payload);

    let crc = compute_crc32(&buffer[LENGTH_PREFIX_SIZE + CRC_SIZE..]);
    buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());

    buffer
}

/// Read the frame length prefix and return the full frame size it implies,
/// after bounds-checking it.
pub fn peek_frame_len(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, FrameError> {
    let frame_length = u32::from_le_bytes(prefix);
    let length = frame_length as usize;
    if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&length) {
        return Err(FrameError::BadLength(frame_length));
    }
    Ok(LENGTH_PREFIX_SIZE + length)
}

/// Validate the frame at the start of `data` and return its end offset plus
/// the CRC-covered inner bytes.
fn split_frame(data: &[u8]) -> Result<(usize, &[u8]), FrameError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::Truncated {
            needed: LENGTH_PREFIX_SIZE,
            available: data.len(),
        });
    }
    let frame_end = peek_frame_len([data[0], data[1], data[2], data[3]])?;
    if data.len() < frame_end {
        return Err(FrameError::Truncated {
            needed: frame_end,
            available: data.len(),
        });
    }

    let stored = read_u32(&data[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + CRC_SIZE]);
    let inner = &data[LENGTH_PREFIX_SIZE + CRC_SIZE..frame_end];
    let computed = compute_crc32(inner);
    if stored != computed {
        return Err(FrameError::CrcMismatch { stored, computed });
    }

    let declared = read_u32(&inner[9..13]);
    if declared as usize != inner.len() - FIXED_FIELDS_SIZE {
        return Err(FrameError::PayloadMismatch {
            declared,
            frame_length: (frame_end - LENGTH_PREFIX_SIZE) as u32,
        });
    }

    Ok((frame_end, inner))
}

/// Encode one offset index entry.
pub fn encode_index_entry(version: Version, offset: u64) -> [u8; INDEX_ENTRY_SIZE as usize] {
    let mut bytes = [0u8; INDEX_ENTRY_SIZE as usize];
    bytes[0..8].copy_from_slice(&version.to_le_bytes());
    bytes[8..16].copy_from_slice(&offset.to_le_bytes());
    bytes
}

/// Decode one offset index entry into `(version, offset)`.
pub fn decode_index_entry(bytes: &[u8; INDEX_ENTRY_SIZE as usize]) -> (Version, u64) {
    (read_i64(&bytes[0..8]), read_u64(&bytes[8..16]))
}

/// Compute a CRC32 checksum over the given byte slice using the IEEE
/// polynomial (same as zlib/gzip).
pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}
