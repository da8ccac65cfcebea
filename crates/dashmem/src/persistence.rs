// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Snapshot persistence with corruption detection.
//!
//! A snapshot is the serialized id-map; secondary indexes and the HNSW graph
//! are rebuilt on load (inserts replayed in id order), so the only external
//! contract is that a shutdown -> start -> load round-trip preserves every
//! data-model invariant.
//!
//! File format (20-byte header + payload):
//! - Bytes 0-3:   Magic "DMEM"
//! - Bytes 4-7:   Format version (u32 little-endian)
//! - Bytes 8-11:  CRC32 checksum of payload (u32 little-endian)
//! - Bytes 12-19: Payload length (u64 little-endian)
//! - Bytes 20+:   Payload (bincode-serialized entries)
//!
//! Writes go to a unique temp file, fsync, then atomic rename, so a crash
//! mid-write never leaves a torn snapshot behind.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::types::MemoryEntry;

/// Magic bytes identifying a DashMem snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"DMEM";

/// Current snapshot format version. Bump when the header or payload
/// serialization changes.
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8).
const SNAPSHOT_HEADER_SIZE: usize = 20;

#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    entries: Vec<MemoryEntry>,
}

/// Wrap payload bytes with the integrity header.
#[must_use]
fn wrap(data: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(data);
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + data.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Verify the integrity header and return the payload slice.
fn unwrap(data: &[u8]) -> Result<&[u8]> {
    if data.len() < SNAPSHOT_HEADER_SIZE {
        return Err(MemoryError::IntegrityCheckFailed {
            reason: format!(
                "file too small: {} bytes (minimum {SNAPSHOT_HEADER_SIZE})",
                data.len()
            ),
        });
    }
    if &data[0..4] != SNAPSHOT_MAGIC {
        return Err(MemoryError::IntegrityCheckFailed {
            reason: format!("bad magic bytes {:?}", &data[0..4]),
        });
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version > SNAPSHOT_FORMAT_VERSION {
        return Err(MemoryError::IntegrityCheckFailed {
            reason: format!(
                "unsupported format version {version} (supported up to {SNAPSHOT_FORMAT_VERSION})"
            ),
        });
    }
    let stored_checksum = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let declared_len = u64::from_le_bytes([
        data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
    ]);
    let payload = &data[SNAPSHOT_HEADER_SIZE..];
    if declared_len != payload.len() as u64 {
        return Err(MemoryError::IntegrityCheckFailed {
            reason: format!(
                "length mismatch: declared {declared_len}, actual {}",
                payload.len()
            ),
        });
    }
    let computed = crc32fast::hash(payload);
    if stored_checksum != computed {
        return Err(MemoryError::IntegrityCheckFailed {
            reason: format!(
                "checksum mismatch: stored 0x{stored_checksum:08X}, computed 0x{computed:08X}"
            ),
        });
    }
    Ok(payload)
}

/// Atomic file write: temp file, fsync, rename.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);
    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Serialize entries and write a snapshot file.
pub fn write_snapshot(path: &Path, entries: &[MemoryEntry]) -> Result<()> {
    let payload = SnapshotPayload {
        entries: entries.to_vec(),
    };
    let serialized =
        bincode::serialize(&payload).map_err(|e| MemoryError::Serialization {
            reason: format!("failed to serialize snapshot: {e}"),
        })?;
    atomic_write(path, &wrap(&serialized))
}

/// Read and verify a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<Vec<MemoryEntry>> {
    let data = std::fs::read(path)?;
    let payload = unwrap(&data)?;
    let snapshot: SnapshotPayload =
        bincode::deserialize(payload).map_err(|e| MemoryError::Serialization {
            reason: format!("failed to deserialize snapshot '{}': {e}", path.display()),
        })?;
    Ok(snapshot.entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<MemoryEntry> {
        vec![
            MemoryEntry::new("a", "alpha", "ns").with_embedding(vec![1.0, 0.0]),
            MemoryEntry::new("b", "beta", "ns")
                .with_tag("t")
                .with_metadata("n", 3i64),
        ]
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let entries = sample_entries();
        write_snapshot(&path, &entries).unwrap();
        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        write_snapshot(&path, &sample_entries()).unwrap();

        // Flip a byte in the payload.
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, MemoryError::IntegrityCheckFailed { .. }));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        std::fs::write(&path, b"NOPE-not-a-snapshot-file-at-all").unwrap();
        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, MemoryError::IntegrityCheckFailed { .. }));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        std::fs::write(&path, b"DM").unwrap();
        let err = read_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        write_snapshot(&path, &sample_entries()).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data[4..8].copy_from_slice(&99u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        let err = read_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_snapshot(Path::new("/nonexistent/snapshot.bin")).unwrap_err();
        assert!(matches!(err, MemoryError::Io(_)));
    }

    #[test]
    fn test_empty_entry_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        write_snapshot(&path, &[]).unwrap();
        assert!(read_snapshot(&path).unwrap().is_empty());
    }
}
