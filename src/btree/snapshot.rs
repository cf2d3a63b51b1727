//! On-disk snapshot of one store file
//!
//! Layout:
//!
//! ```text
//! magic "XSDB" | version u8 | entry count u64 LE
//! repeated: key len u32 LE | key | value len u32 LE | value
//! crc32 u32 LE over everything above
//! ```
//!
//! Written to `<file>.tmp`, fsynced, then renamed over the live file so a
//! crash leaves either the old or the new snapshot.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use super::checksum::{compute_checksum, verify_checksum};
use crate::errors::{StorageError, StorageResult};

const MAGIC: &[u8; 4] = b"XSDB";
const VERSION: u8 = 1;

pub(crate) fn write_snapshot(path: &Path, entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> StorageResult<()> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (key, value) in entries {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    let crc = compute_checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_snapshot(path: &Path) -> StorageResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    let data = fs::read(path)?;
    let corrupt = |what: &str| {
        StorageError::storage(format!("{}: {}", path.display(), what))
    };

    if data.len() < MAGIC.len() + 1 + 8 + 4 {
        return Err(corrupt("snapshot too short"));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if !verify_checksum(body, crc) {
        return Err(corrupt("snapshot checksum mismatch"));
    }
    if &body[..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    if body[4] != VERSION {
        return Err(corrupt("unsupported snapshot version"));
    }

    let mut pos = 5;
    let count = read_u64(body, &mut pos).ok_or_else(|| corrupt("truncated header"))?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_chunk(body, &mut pos).ok_or_else(|| corrupt("truncated key"))?;
        let value = read_chunk(body, &mut pos).ok_or_else(|| corrupt("truncated value"))?;
        entries.insert(key, value);
    }
    if pos != body.len() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(entries)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = data.get(*pos..*pos + 8)?;
    *pos += 8;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Some(u64::from_le_bytes(arr))
}

fn read_chunk(data: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let len_bytes = data.get(*pos..*pos + 4)?;
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    *pos += 4;
    let chunk = data.get(*pos..*pos + len)?.to_vec();
    *pos += len;
    Some(chunk)
}
