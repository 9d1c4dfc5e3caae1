// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The in-memory oid → file offset index, and its on-disk sidecar snapshot.
//!
//! Oids are split into a 6-byte prefix, which selects a bucket, and a 2-byte suffix keyed
//! within it. Offsets are packed into 6 bytes, which bounds the data file at 256 TiB.

use crate::error::{Result, StorageError};
use crate::types::{Oid, Tid};
use binary_layout::binary_layout;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAX_POS: u64 = (1 << 48) - 1;

const SIDECAR_MAGIC: u32 = u32::from_be_bytes(*b"FSIX");
/// Flat (oid, pos) pairs. Still readable, never written.
const SIDECAR_V1: u16 = 1;
/// Bucketed entries.
const SIDECAR_V2: u16 = 2;
pub const SIDECAR_VERSION: u16 = SIDECAR_V2;

binary_layout!(sidecar_header, BigEndian, {
    magic: u32,
    version: u16,
    pos: u64,
    tid: u64,
    count: u64,
});

binary_layout!(bucket_header, BigEndian, {
    prefix: u64,
    count: u32,
});

binary_layout!(flat_entry, BigEndian, {
    oid: u64,
    pos: u64,
});

const SIDECAR_HEADER_LEN: usize = 30;
const BUCKET_HEADER_LEN: usize = 12;
const FLAT_ENTRY_LEN: usize = 16;
const PACKED_ENTRY_LEN: usize = 8;

type PackedPos = [u8; 6];

fn pack_pos(pos: u64) -> PackedPos {
    let bytes = pos.to_be_bytes();
    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

fn unpack_pos(packed: &PackedPos) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(packed);
    u64::from_be_bytes(bytes)
}

fn split(oid: Oid) -> (u64, u16) {
    (oid.0 >> 16, oid.0 as u16)
}

fn join(prefix: u64, suffix: u16) -> Oid {
    Oid((prefix << 16) | suffix as u64)
}

/// How much of the log a saved index reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexWatermark {
    /// End offset of the last transaction folded into the index.
    pub pos: u64,
    /// Tid of that transaction, or zero for an empty log.
    pub tid: Tid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsIndex {
    buckets: BTreeMap<u64, BTreeMap<u16, PackedPos>>,
    len: usize,
}

impl FsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<u64> {
        let (prefix, suffix) = split(oid);
        self.buckets
            .get(&prefix)
            .and_then(|bucket| bucket.get(&suffix))
            .map(unpack_pos)
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.get(oid).is_some()
    }

    pub fn set(&mut self, oid: Oid, pos: u64) -> Result<()> {
        if pos > MAX_POS {
            return Err(StorageError::corrupted(
                pos,
                format!("offset for oid {oid} does not fit in 48 bits"),
            ));
        }
        let (prefix, suffix) = split(oid);
        if self
            .buckets
            .entry(prefix)
            .or_default()
            .insert(suffix, pack_pos(pos))
            .is_none()
        {
            self.len += 1;
        }
        Ok(())
    }

    pub fn update(&mut self, entries: impl IntoIterator<Item = (Oid, u64)>) -> Result<()> {
        for (oid, pos) in entries {
            self.set(oid, pos)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, oid: Oid) -> Option<u64> {
        let (prefix, suffix) = split(oid);
        let bucket = self.buckets.get_mut(&prefix)?;
        let removed = bucket.remove(&suffix)?;
        if bucket.is_empty() {
            self.buckets.remove(&prefix);
        }
        self.len -= 1;
        Some(unpack_pos(&removed))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn min_key(&self) -> Option<Oid> {
        let (prefix, bucket) = self.buckets.first_key_value()?;
        bucket.keys().next().map(|suffix| join(*prefix, *suffix))
    }

    pub fn max_key(&self) -> Option<Oid> {
        let (prefix, bucket) = self.buckets.last_key_value()?;
        bucket.keys().next_back().map(|suffix| join(*prefix, *suffix))
    }

    /// Entries in ascending oid order.
    pub fn iter(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.buckets.iter().flat_map(|(prefix, bucket)| {
            bucket
                .iter()
                .map(move |(suffix, pos)| (join(*prefix, *suffix), unpack_pos(pos)))
        })
    }

    /// Atomically replaces the sidecar at `path` with this index and `watermark`.
    pub fn save(&self, path: &Path, watermark: IndexWatermark) -> Result<()> {
        let tmp_path = sibling(path, ".tmp");
        let result = self.write_sidecar(&tmp_path, watermark);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
            return result;
        }
        fs::rename(&tmp_path, path)?;
        debug!(
            "Saved index of {} oids to {:?} at watermark {}",
            self.len, path, watermark.pos
        );
        Ok(())
    }

    fn write_sidecar(&self, path: &Path, watermark: IndexWatermark) -> Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        let mut header = [0u8; SIDECAR_HEADER_LEN];
        let mut view = sidecar_header::View::new(&mut header[..]);
        view.magic_mut().write(SIDECAR_MAGIC);
        view.version_mut().write(SIDECAR_VERSION);
        view.pos_mut().write(watermark.pos);
        view.tid_mut().write(watermark.tid.0);
        view.count_mut().write(self.len as u64);
        out.write_all(&header)?;

        for (prefix, bucket) in &self.buckets {
            let mut bucket_buf = [0u8; BUCKET_HEADER_LEN];
            let mut view = bucket_header::View::new(&mut bucket_buf[..]);
            view.prefix_mut().write(*prefix);
            view.count_mut().write(bucket.len() as u32);
            out.write_all(&bucket_buf)?;
            for (suffix, pos) in bucket {
                let entry = ((*suffix as u64) << 48) | unpack_pos(pos);
                out.write_all(&entry.to_be_bytes())?;
            }
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Loads a sidecar. Anything missing, truncated or unrecognized yields `None`, and the
    /// caller falls back to scanning the log.
    pub fn load(path: &Path) -> Option<(IndexWatermark, FsIndex)> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Unable to read index {:?}: {}", path, e);
                return None;
            }
        };
        let parsed = Self::parse(&bytes);
        if parsed.is_none() {
            warn!("Ignoring unreadable index {:?}", path);
        }
        parsed
    }

    fn parse(bytes: &[u8]) -> Option<(IndexWatermark, FsIndex)> {
        if bytes.len() < SIDECAR_HEADER_LEN {
            return None;
        }
        let view = sidecar_header::View::new(&bytes[..SIDECAR_HEADER_LEN]);
        if view.magic().read() != SIDECAR_MAGIC {
            return None;
        }
        let watermark = IndexWatermark {
            pos: view.pos().read(),
            tid: Tid(view.tid().read()),
        };
        let count = view.count().read();
        let body = &bytes[SIDECAR_HEADER_LEN..];
        let index = match view.version().read() {
            SIDECAR_V1 => Self::parse_flat(body, count)?,
            SIDECAR_V2 => Self::parse_buckets(body, count)?,
            other => {
                warn!("Unknown index version {}", other);
                return None;
            }
        };
        Some((watermark, index))
    }

    fn parse_flat(body: &[u8], count: u64) -> Option<FsIndex> {
        if body.len() as u64 != count.checked_mul(FLAT_ENTRY_LEN as u64)? {
            return None;
        }
        let mut index = FsIndex::new();
        for chunk in body.chunks_exact(FLAT_ENTRY_LEN) {
            let view = flat_entry::View::new(chunk);
            index.set(Oid(view.oid().read()), view.pos().read()).ok()?;
        }
        Some(index)
    }

    fn parse_buckets(mut body: &[u8], count: u64) -> Option<FsIndex> {
        let mut index = FsIndex::new();
        while !body.is_empty() {
            if body.len() < BUCKET_HEADER_LEN {
                return None;
            }
            let view = bucket_header::View::new(&body[..BUCKET_HEADER_LEN]);
            let prefix = view.prefix().read();
            let entries = view.count().read() as usize;
            body = &body[BUCKET_HEADER_LEN..];
            let entries_len = entries.checked_mul(PACKED_ENTRY_LEN)?;
            if body.len() < entries_len {
                return None;
            }
            for chunk in body[..entries_len].chunks_exact(PACKED_ENTRY_LEN) {
                let entry = u64::from_be_bytes(chunk.try_into().ok()?);
                index.set(join(prefix, (entry >> 48) as u16), entry & MAX_POS).ok()?;
            }
            body = &body[entries_len..];
        }
        (index.len as u64 == count).then_some(index)
    }

    #[cfg(test)]
    pub(crate) fn save_v1(&self, path: &Path, watermark: IndexWatermark) -> Result<()> {
        let mut out = Vec::new();
        let mut header = [0u8; SIDECAR_HEADER_LEN];
        let mut view = sidecar_header::View::new(&mut header[..]);
        view.magic_mut().write(SIDECAR_MAGIC);
        view.version_mut().write(SIDECAR_V1);
        view.pos_mut().write(watermark.pos);
        view.tid_mut().write(watermark.tid.0);
        view.count_mut().write(self.len as u64);
        out.extend_from_slice(&header);
        for (oid, pos) in self.iter() {
            let mut entry = [0u8; FLAT_ENTRY_LEN];
            let mut view = flat_entry::View::new(&mut entry[..]);
            view.oid_mut().write(oid.0);
            view.pos_mut().write(pos);
            out.extend_from_slice(&entry);
        }
        fs::write(path, out)?;
        Ok(())
    }
}

/// `path` with `suffix` appended to its file name, e.g. `data.fs` → `data.fs.tmp`.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
