//! Snapshot object format
//!
//! ```text
//! "PGSNAP01"
//! frame*:  tag:u8 | table_len:u16 | table | payload_len:u32 | payload
//! trailer: frame with tag 0xFF whose payload is the JSON manifest
//! ```
//!
//! Integers are big-endian. `Rows` payloads start with a `u64` row count
//! followed by `COPY ... TEXT` data; `TableEnd` payloads are the table's
//! `u64` row total. The manifest carries a CRC32 over every byte before the
//! trailer frame, so a truncated or spliced object is always detected.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Lsn, SnapshotChunk};

/// File magic.
pub const MAGIC: &[u8; 8] = b"PGSNAP01";

const TAG_SCHEMA: u8 = 1;
const TAG_ROWS: u8 = 2;
const TAG_TABLE_END: u8 = 3;
const TAG_TRAILER: u8 = 0xFF;

/// Fixed bytes in a frame header besides the table name.
const FRAME_HEADER: usize = 1 + 2 + 4;

/// Errors decoding or encoding a snapshot object.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The object does not start with the magic bytes.
    #[error("not a snapshot object (bad magic)")]
    BadMagic,

    /// The object ended before the trailer.
    #[error("snapshot truncated: {0}")]
    Truncated(String),

    /// A frame could not be parsed.
    #[error("corrupt snapshot frame: {0}")]
    Corrupt(String),

    /// The trailer disagrees with the frames.
    #[error("snapshot trailer mismatch: {0}")]
    Mismatch(String),

    /// A field exceeds its on-disk width.
    #[error("value too large to encode: {0}")]
    TooLarge(String),
}

/// Trailer contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Job the snapshot belongs to.
    pub job_id: String,
    /// Server snapshot identifier.
    pub snapshot_id: String,
    /// Slot the snapshot is anchored to.
    pub slot: String,
    /// Start position of the anchored slot.
    pub consistent_lsn: Lsn,
    /// Rows per table.
    pub tables: BTreeMap<String, u64>,
    /// Number of frames before the trailer.
    pub frames: u64,
    /// CRC32 over everything before the trailer.
    pub crc32: u32,
    /// Export completion time.
    pub created_at: DateTime<Utc>,
}

/// Identity fields the encoder cannot derive from frames.
#[derive(Debug, Clone)]
pub struct ManifestHeader {
    /// Job id.
    pub job_id: String,
    /// Server snapshot identifier.
    pub snapshot_id: String,
    /// Anchor slot.
    pub slot: String,
    /// Anchor position.
    pub consistent_lsn: Lsn,
}

fn frame(tag: u8, table: &str, payload: &[u8]) -> Result<Bytes, FormatError> {
    let table_len = u16::try_from(table.len())
        .map_err(|_| FormatError::TooLarge(format!("table name '{table}'")))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| FormatError::TooLarge(format!("{} byte payload", payload.len())))?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER + table.len() + payload.len());
    buf.put_u8(tag);
    buf.put_u16(table_len);
    buf.put_slice(table.as_bytes());
    buf.put_u32(payload_len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Turns [`SnapshotChunk`]s into framed bytes.
#[derive(Default)]
pub struct SnapshotEncoder {
    hasher: crc32fast::Hasher,
    frames: u64,
    streamed: BTreeMap<String, u64>,
    finished: BTreeMap<String, u64>,
}

impl SnapshotEncoder {
    /// Fresh encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Magic header; must be written first.
    pub fn header(&mut self) -> Bytes {
        self.hasher.update(MAGIC);
        Bytes::from_static(MAGIC)
    }

    /// Encode one chunk.
    pub fn encode(&mut self, chunk: &SnapshotChunk) -> Result<Bytes, FormatError> {
        let bytes = match chunk {
            SnapshotChunk::Schema { table, ddl } => frame(TAG_SCHEMA, table, ddl.as_bytes())?,
            SnapshotChunk::Rows { table, data, rows } => {
                *self.streamed.entry(table.clone()).or_default() += rows;
                let mut payload = BytesMut::with_capacity(8 + data.len());
                payload.put_u64(*rows);
                payload.put_slice(data);
                frame(TAG_ROWS, table, &payload)?
            }
            SnapshotChunk::TableEnd { table, rows } => {
                let streamed = self.streamed.get(table).copied().unwrap_or(0);
                if streamed != *rows {
                    return Err(FormatError::Mismatch(format!(
                        "table {table}: {streamed} rows streamed, {rows} reported"
                    )));
                }
                self.finished.insert(table.clone(), *rows);
                frame(TAG_TABLE_END, table, &rows.to_be_bytes())?
            }
        };
        self.hasher.update(&bytes);
        self.frames += 1;
        Ok(bytes)
    }

    /// Tables whose data has been completely encoded.
    pub fn tables(&self) -> &BTreeMap<String, u64> {
        &self.finished
    }

    /// Encode the trailer. Consumes the encoder.
    pub fn trailer(self, header: ManifestHeader) -> Result<(Bytes, SnapshotManifest), FormatError> {
        let manifest = SnapshotManifest {
            job_id: header.job_id,
            snapshot_id: header.snapshot_id,
            slot: header.slot,
            consistent_lsn: header.consistent_lsn,
            tables: self.finished,
            frames: self.frames,
            crc32: self.hasher.finalize(),
            created_at: Utc::now(),
        };
        let payload =
            serde_json::to_vec(&manifest).map_err(|e| FormatError::Corrupt(e.to_string()))?;
        Ok((frame(TAG_TRAILER, "", &payload)?, manifest))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data chunk.
    Chunk(SnapshotChunk),
    /// The verified trailer.
    Trailer(SnapshotManifest),
}

/// Incremental decoder; feed it bytes as they arrive.
#[derive(Default)]
pub struct SnapshotDecoder {
    buf: BytesMut,
    hasher: crc32fast::Hasher,
    magic_seen: bool,
    frames: u64,
    table_ends: BTreeMap<String, u64>,
    manifest: Option<SnapshotManifest>,
}

impl SnapshotDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FormatError> {
        if self.manifest.is_some() {
            if !self.buf.is_empty() {
                return Err(FormatError::Corrupt(format!(
                    "{} bytes after trailer",
                    self.buf.len()
                )));
            }
            return Ok(None);
        }

        if !self.magic_seen {
            if self.buf.len() < MAGIC.len() {
                return Ok(None);
            }
            if &self.buf[..MAGIC.len()] != MAGIC {
                return Err(FormatError::BadMagic);
            }
            let magic = self.buf.split_to(MAGIC.len());
            self.hasher.update(&magic);
            self.magic_seen = true;
        }

        if self.buf.len() < 3 {
            return Ok(None);
        }
        let table_len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        if self.buf.len() < 3 + table_len + 4 {
            return Ok(None);
        }
        let len_at = 3 + table_len;
        let payload_len = u32::from_be_bytes([
            self.buf[len_at],
            self.buf[len_at + 1],
            self.buf[len_at + 2],
            self.buf[len_at + 3],
        ]) as usize;
        let total = FRAME_HEADER + table_len + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let raw = self.buf.split_to(total).freeze();
        let mut cursor = raw.clone();
        let tag = cursor.get_u8();
        cursor.advance(2);
        let table = String::from_utf8(cursor.split_to(table_len).to_vec())
            .map_err(|_| FormatError::Corrupt("table name is not UTF-8".into()))?;
        cursor.advance(4);
        let mut payload = cursor;

        if tag == TAG_TRAILER {
            let manifest: SnapshotManifest = serde_json::from_slice(&payload)
                .map_err(|e| FormatError::Corrupt(format!("trailer: {e}")))?;
            self.verify(&manifest)?;
            self.manifest = Some(manifest.clone());
            return Ok(Some(Frame::Trailer(manifest)));
        }

        self.hasher.update(&raw);
        self.frames += 1;
        let chunk = match tag {
            TAG_SCHEMA => SnapshotChunk::Schema {
                table,
                ddl: String::from_utf8(payload.to_vec())
                    .map_err(|_| FormatError::Corrupt("DDL is not UTF-8".into()))?,
            },
            TAG_ROWS => {
                if payload.len() < 8 {
                    return Err(FormatError::Corrupt("short rows frame".into()));
                }
                let rows = payload.get_u64();
                SnapshotChunk::Rows {
                    table,
                    data: payload,
                    rows,
                }
            }
            TAG_TABLE_END => {
                if payload.len() != 8 {
                    return Err(FormatError::Corrupt("bad table-end frame".into()));
                }
                let rows = payload.get_u64();
                self.table_ends.insert(table.clone(), rows);
                SnapshotChunk::TableEnd { table, rows }
            }
            other => return Err(FormatError::Corrupt(format!("unknown frame tag {other:#x}"))),
        };
        Ok(Some(Frame::Chunk(chunk)))
    }

    fn verify(&self, manifest: &SnapshotManifest) -> Result<(), FormatError> {
        let crc = self.hasher.clone().finalize();
        if crc != manifest.crc32 {
            return Err(FormatError::Mismatch(format!(
                "crc32 {crc:08x} != trailer {:08x}",
                manifest.crc32
            )));
        }
        if self.frames != manifest.frames {
            return Err(FormatError::Mismatch(format!(
                "{} frames read, trailer says {}",
                self.frames, manifest.frames
            )));
        }
        if self.table_ends != manifest.tables {
            return Err(FormatError::Mismatch("per-table row counts differ".into()));
        }
        Ok(())
    }

    /// Verified manifest once the object is fully consumed.
    pub fn finish(self) -> Result<SnapshotManifest, FormatError> {
        match self.manifest {
            Some(m) if self.buf.is_empty() => Ok(m),
            Some(_) => Err(FormatError::Corrupt("bytes after trailer".into())),
            None => Err(FormatError::Truncated(format!(
                "no trailer after {} frames ({} bytes pending)",
                self.frames,
                self.buf.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn header() -> ManifestHeader {
        ManifestHeader {
            job_id: "job".into(),
            snapshot_id: "00000003-1".into(),
            slot: "pgshift_job".into(),
            consistent_lsn: Lsn(0x1000),
        }
    }

    fn encode_users() -> (Vec<u8>, SnapshotManifest) {
        let mut enc = SnapshotEncoder::new();
        let mut out = enc.header().to_vec();
        for chunk in [
            SnapshotChunk::Schema {
                table: "users".into(),
                ddl: "CREATE TABLE users (id int)".into(),
            },
            SnapshotChunk::Rows {
                table: "users".into(),
                data: Bytes::from_static(b"1\n2\n3\n"),
                rows: 3,
            },
            SnapshotChunk::TableEnd {
                table: "users".into(),
                rows: 3,
            },
        ] {
            out.extend_from_slice(&enc.encode(&chunk).unwrap());
        }
        let (trailer, manifest) = enc.trailer(header()).unwrap();
        out.extend_from_slice(&trailer);
        (out, manifest)
    }

    fn decode_all(bytes: &[u8], step: usize) -> Result<(Vec<SnapshotChunk>, SnapshotManifest), FormatError> {
        let mut dec = SnapshotDecoder::new();
        let mut chunks = Vec::new();
        for piece in bytes.chunks(step) {
            dec.feed(piece);
            while let Some(frame) = dec.next_frame()? {
                if let Frame::Chunk(c) = frame {
                    chunks.push(c);
                }
            }
        }
        Ok((chunks, dec.finish()?))
    }

    #[test]
    fn test_decode_in_small_pieces() {
        let (bytes, manifest) = encode_users();
        let (chunks, decoded) = decode_all(&bytes, 5).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.tables.get("users"), Some(&3));
    }

    #[test]
    fn test_truncation_detected() {
        let (bytes, _) = encode_users();
        let cut = &bytes[..bytes.len() - 10];
        assert!(matches!(decode_all(cut, 64), Err(FormatError::Truncated(_))));
    }

    #[test]
    fn test_flipped_byte_detected() {
        let (mut bytes, _) = encode_users();
        // inside the rows payload
        let pos = bytes.windows(2).position(|w| w == b"2\n").unwrap();
        bytes[pos] = b'9';
        assert!(matches!(decode_all(&bytes, 64), Err(FormatError::Mismatch(_))));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            decode_all(b"NOTASNAPSHOT", 64),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn test_encoder_rejects_inconsistent_table_end() {
        let mut enc = SnapshotEncoder::new();
        enc.header();
        enc.encode(&SnapshotChunk::Rows {
            table: "t".into(),
            data: Bytes::from_static(b"1\n"),
            rows: 1,
        })
        .unwrap();
        let err = enc
            .encode(&SnapshotChunk::TableEnd {
                table: "t".into(),
                rows: 2,
            })
            .unwrap_err();
        assert!(matches!(err, FormatError::Mismatch(_)));
    }
}
