//! Logical record codec.
//!
//! Every WAL chunk payload is one encoded record:
//!
//! ```text
//! varint(batch_id) | kind(u8) | varint(expire_at_nanos) |
//! varint(key_len) | key_bytes | varint(value_len) | value_bytes
//! ```
//!
//! `expire_at_nanos` is an absolute Unix timestamp in nanoseconds; 0 means the
//! record never expires. A `BatchEnd` record has an empty key and value and
//! marks the commit point of every record sharing its batch id. Decoding is
//! strict: an unknown kind or a short buffer is corruption, never a guess.

use crate::error::{CellarError, CellarResult};

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 4 * 1024;

/// Maximum value size in bytes (256 MiB).
pub const MAX_VALUE_SIZE: usize = 256 * 1024 * 1024;

/// Record kinds as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Insert or update a key.
    Put = 1,
    /// Remove a key.
    Delete = 2,
    /// Commit marker: all preceding records with the same batch id are atomic.
    BatchEnd = 3,
}

impl RecordKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(RecordKind::Put),
            2 => Some(RecordKind::Delete),
            3 => Some(RecordKind::BatchEnd),
            _ => None,
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub batch_id: u64,
    pub expire_at: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// Build the commit marker for a batch.
    pub fn batch_end(batch_id: u64) -> Self {
        Self {
            kind: RecordKind::BatchEnd,
            batch_id,
            expire_at: 0,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Encode into a chunk payload.
    pub fn encode(&self) -> Vec<u8> {
        encode_record(self.kind, self.batch_id, self.expire_at, &self.key, &self.value)
    }

    /// Decode a chunk payload. `offset` is only used for error context.
    pub fn decode(data: &[u8], offset: u64) -> CellarResult<Record> {
        let corrupt = |reason: String| CellarError::CorruptRecord {
            path: None,
            offset,
            reason,
        };

        let mut pos = 0usize;
        let batch_id = take_uvarint(data, &mut pos)
            .ok_or_else(|| corrupt("truncated batch id".into()))?;
        let raw_kind = *data
            .get(pos)
            .ok_or_else(|| corrupt("missing record kind".into()))?;
        pos += 1;
        let kind = RecordKind::from_u8(raw_kind)
            .ok_or_else(|| corrupt(format!("unknown record kind: {}", raw_kind)))?;
        let expire_at = take_uvarint(data, &mut pos)
            .ok_or_else(|| corrupt("truncated expiry".into()))?;

        let key_len = take_uvarint(data, &mut pos)
            .ok_or_else(|| corrupt("truncated key length".into()))? as usize;
        if key_len > MAX_KEY_SIZE || pos + key_len > data.len() {
            return Err(corrupt(format!("implausible key length: {}", key_len)));
        }
        let key = data[pos..pos + key_len].to_vec();
        pos += key_len;

        let value_len = take_uvarint(data, &mut pos)
            .ok_or_else(|| corrupt("truncated value length".into()))? as usize;
        if value_len > MAX_VALUE_SIZE || pos + value_len > data.len() {
            return Err(corrupt(format!("implausible value length: {}", value_len)));
        }
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        if pos != data.len() {
            return Err(corrupt(format!(
                "{} trailing bytes after record",
                data.len() - pos
            )));
        }
        if kind == RecordKind::BatchEnd && !key.is_empty() {
            return Err(corrupt("batch-end record carries a key".into()));
        }

        Ok(Record {
            kind,
            batch_id,
            expire_at,
            key,
            value,
        })
    }
}

/// Encode record fields without building an owned [`Record`] first; the
/// commit path borrows keys and values straight from the pending buffer.
pub(crate) fn encode_record(
    kind: RecordKind,
    batch_id: u64,
    expire_at: u64,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 * MAX_UVARINT_LEN + 1 + key.len() + value.len());
    put_uvarint(&mut buf, batch_id);
    buf.push(kind as u8);
    put_uvarint(&mut buf, expire_at);
    put_uvarint(&mut buf, key.len() as u64);
    buf.extend_from_slice(key);
    put_uvarint(&mut buf, value.len() as u64);
    buf.extend_from_slice(value);
    buf
}

const MAX_UVARINT_LEN: usize = 10;

/// LEB128 unsigned varint, least-significant group first.
fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read a varint at `*pos`, advancing it. None on truncation or overflow.
fn take_uvarint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return None;
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: Record) {
        let encoded = record.encode();
        let decoded = Record::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_put_roundtrip() {
        roundtrip(Record {
            kind: RecordKind::Put,
            batch_id: 42,
            expire_at: 1_700_000_000_000_000_000,
            key: b"user:1001".to_vec(),
            value: b"alice".to_vec(),
        });
    }

    #[test]
    fn test_delete_roundtrip() {
        roundtrip(Record {
            kind: RecordKind::Delete,
            batch_id: u64::MAX,
            expire_at: 0,
            key: b"gone".to_vec(),
            value: Vec::new(),
        });
    }

    #[test]
    fn test_batch_end_roundtrip() {
        roundtrip(Record::batch_end(7));
    }

    #[test]
    fn test_empty_value_roundtrip() {
        roundtrip(Record {
            kind: RecordKind::Put,
            batch_id: 1,
            expire_at: 0,
            key: b"k".to_vec(),
            value: Vec::new(),
        });
    }

    #[test]
    fn test_unknown_kind_is_corrupt() {
        let mut encoded = Record::batch_end(9).encode();
        // kind byte sits right after the single-byte batch id varint
        encoded[1] = 0xEE;
        assert!(matches!(
            Record::decode(&encoded, 0),
            Err(CellarError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_truncated_buffer_is_corrupt() {
        let encoded = Record {
            kind: RecordKind::Put,
            batch_id: 3,
            expire_at: 0,
            key: b"key".to_vec(),
            value: b"value".to_vec(),
        }
        .encode();
        for cut in 0..encoded.len() {
            assert!(
                Record::decode(&encoded[..cut], 0).is_err(),
                "cut at {} should not decode",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let mut encoded = Record::batch_end(1).encode();
        encoded.push(0x00);
        assert!(Record::decode(&encoded, 0).is_err());
    }

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(take_uvarint(&buf, &mut pos), Some(v));
            assert_eq!(pos, buf.len());
        }
    }
}
