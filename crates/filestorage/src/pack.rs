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

//! Offline packing: rewrite the log without history older than a cutoff and, optionally,
//! without objects unreachable from the root.
//!
//! The default [`FileStoragePacker`] works in two passes over the source log. Transactions up
//! to the pack point keep only each live object's revision current as of that point and are
//! marked packed. Later transactions are copied whole, with their record pointers remapped to
//! the new offsets.

use crate::error::Result;
use crate::format::{MAGIC, MAGIC_LEN, RecordData, TxnStatus, encode_data_record, encode_txn_meta};
use crate::index::{FsIndex, sibling};
use crate::scanner::{DataRecords, TxnRecord, data_pos, read_data_record, read_payload, read_txn, read_txn_header};
use crate::types::{Oid, Tid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a packer gets to work with.
pub struct PackSource<'a> {
    /// Path of the live data file. The packed copy is written beside it.
    pub path: &'a Path,
    pub file: &'a File,
    /// End of the committed log when the pack started.
    pub end: u64,
    pub cutoff: Tid,
    pub gc: bool,
    /// Extracts the oids a payload refers to.
    pub refs_of: &'a dyn Fn(&[u8]) -> Vec<Oid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Last transaction treated as history.
    pub packed_tid: Tid,
    pub old_size: u64,
    pub new_size: u64,
    pub transactions_dropped: usize,
    pub records_dropped: usize,
    pub oids: usize,
}

/// A record whose backpointer target was dropped and whose payload was copied inline, so the
/// blob stored under revision `from` must also be reachable as revision `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRelink {
    pub oid: Oid,
    pub from: Tid,
    pub to: Tid,
}

#[derive(Debug)]
pub struct PackOutcome {
    /// The packed file, ready to be renamed over the live one.
    pub path: PathBuf,
    pub index: FsIndex,
    pub end: u64,
    pub relinked: Vec<BlobRelink>,
    pub stats: PackStats,
}

pub trait Packer: Send + Sync {
    /// Writes a packed copy of the source log and describes it. Returns `None` when no
    /// committed transaction is at or before the cutoff. On error no packed file is left behind.
    fn pack(&self, source: &PackSource<'_>) -> Result<Option<PackOutcome>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileStoragePacker;

impl Packer for FileStoragePacker {
    fn pack(&self, source: &PackSource<'_>) -> Result<Option<PackOutcome>> {
        let Some((packed_tid, packpos)) = pack_point(source)? else {
            return Ok(None);
        };
        let pack_path = sibling(source.path, ".pack");
        let result = write_pack(source, packed_tid, packpos, &pack_path);
        if result.is_err()
            && let Err(e) = fs::remove_file(&pack_path)
        {
            warn!("Unable to remove partial pack file {:?}: {}", pack_path, e);
        }
        result.map(Some)
    }
}

/// The last visible transaction at or before the cutoff, and the offset just past it.
fn pack_point(source: &PackSource<'_>) -> Result<Option<(Tid, u64)>> {
    let mut found = None;
    let mut pos = MAGIC_LEN;
    while pos < source.end {
        let header = read_txn_header(source.file, pos, source.end)?;
        if header.tid > source.cutoff {
            break;
        }
        pos += header.total_len();
        if header.status.is_visible() {
            found = Some((header.tid, pos));
        }
    }
    Ok(found)
}

/// Visible transactions in `[from, to)`.
fn visible_txns(file: &File, from: u64, to: u64, end: u64) -> impl Iterator<Item = Result<TxnRecord>> + '_ {
    let mut pos = from;
    std::iter::from_fn(move || {
        while pos < to {
            let txn = match read_txn(file, pos, end) {
                Ok(txn) => txn,
                Err(e) => {
                    pos = to;
                    return Some(Err(e));
                }
            };
            pos = txn.end();
            if txn.status().is_visible() {
                return Some(Ok(txn));
            }
        }
        None
    })
}

/// Each object's current record as of the pack point.
fn state_as_of(file: &File, packpos: u64, end: u64) -> Result<HashMap<Oid, u64>> {
    let mut as_of = HashMap::new();
    for txn in visible_txns(file, MAGIC_LEN, packpos, end) {
        for record in DataRecords::new(file, &txn?) {
            let record = record?;
            as_of.insert(record.oid(), record.pos);
        }
    }
    Ok(as_of)
}

/// Objects reachable from the root as of the pack point. Everything written after the pack
/// point, and everything those later revisions refer to, is treated as a root too.
fn reachable(
    source: &PackSource<'_>,
    as_of: &HashMap<Oid, u64>,
    packpos: u64,
) -> Result<HashSet<Oid>> {
    let (file, end) = (source.file, source.end);
    let mut queue = VecDeque::from([Oid::ROOT]);
    for txn in visible_txns(file, packpos, end, end) {
        for record in DataRecords::new(file, &txn?) {
            let record = record?;
            queue.push_back(record.oid());
            if let Some(payload) = read_payload(file, record.pos, end)? {
                queue.extend((source.refs_of)(&payload));
            }
        }
    }

    let mut live = HashSet::new();
    while let Some(oid) = queue.pop_front() {
        if !live.insert(oid) {
            continue;
        }
        if let Some(&pos) = as_of.get(&oid)
            && let Some(payload) = read_payload(file, pos, end)?
        {
            queue.extend(
                (source.refs_of)(&payload)
                    .into_iter()
                    .filter(|r| !live.contains(r)),
            );
        }
    }
    Ok(live)
}

struct PackRecord {
    old_pos: u64,
    oid: Oid,
    tid: Tid,
    old_prev: u64,
    data: RecordData,
}

/// Sequential writer for the packed file, tracking the old → new offset of every record.
struct PackWriter {
    out: BufWriter<File>,
    pos: u64,
    remap: HashMap<u64, u64>,
}

impl PackWriter {
    fn create(path: &Path) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        Ok(Self {
            out,
            pos: MAGIC_LEN,
            remap: HashMap::new(),
        })
    }

    /// Writes one transaction, returning the new offsets of its records.
    fn write_txn(
        &mut self,
        txn: &TxnRecord,
        status: TxnStatus,
        records: &[PackRecord],
    ) -> Result<Vec<u64>> {
        let txn_pos = self.pos;
        let meta_len = txn.header.meta_len();
        let mut body = Vec::new();
        let mut positions = Vec::with_capacity(records.len());
        for record in records {
            let pos = txn_pos + meta_len + body.len() as u64;
            let prev = self.remap.get(&record.old_prev).copied().unwrap_or(0);
            body.extend(encode_data_record(
                record.oid,
                record.tid,
                prev,
                txn_pos,
                &record.data,
            ));
            self.remap.insert(record.old_pos, pos);
            positions.push(pos);
        }
        let length = meta_len + body.len() as u64;
        let meta = encode_txn_meta(
            txn.tid(),
            length,
            status,
            &txn.user,
            &txn.description,
            &txn.extension,
        )?;
        self.out.write_all(&meta)?;
        self.out.write_all(&body)?;
        self.out.write_all(&length.to_be_bytes())?;
        self.pos += length + 8;
        Ok(positions)
    }

    fn finish(self) -> Result<u64> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(self.pos)
    }
}

/// Replaces a backpointer whose target was not carried over with the payload it resolves to.
fn inline_payload(
    file: &File,
    record_pos: u64,
    oid: Oid,
    tid: Tid,
    end: u64,
    relinked: &mut Vec<BlobRelink>,
) -> Result<RecordData> {
    match data_pos(file, record_pos, end)? {
        0 => Ok(RecordData::Backpointer(0)),
        target => {
            let source = read_data_record(file, target, end)?;
            relinked.push(BlobRelink {
                oid,
                from: source.tid(),
                to: tid,
            });
            Ok(source.data)
        }
    }
}

fn write_pack(
    source: &PackSource<'_>,
    packed_tid: Tid,
    packpos: u64,
    pack_path: &Path,
) -> Result<PackOutcome> {
    let (file, end) = (source.file, source.end);
    let as_of = state_as_of(file, packpos, end)?;
    let live = if source.gc {
        reachable(source, &as_of, packpos)?
    } else {
        as_of.keys().copied().collect()
    };
    debug!(
        "Packing up to {packed_tid} at offset {packpos}: {} of {} objects live",
        live.len(),
        as_of.len()
    );

    let mut writer = PackWriter::create(pack_path)?;
    let mut index = FsIndex::new();
    let mut relinked = Vec::new();
    let mut stats = PackStats {
        packed_tid,
        old_size: end,
        ..PackStats::default()
    };

    let mut pos = MAGIC_LEN;
    while pos < packpos {
        let txn = read_txn(file, pos, end)?;
        pos = txn.end();
        let mut kept = Vec::new();
        for record in DataRecords::new(file, &txn) {
            let record = record?;
            let (old_pos, oid, tid) = (record.pos, record.oid(), record.tid());
            let current = txn.status().is_visible()
                && as_of.get(&oid) == Some(&old_pos)
                && live.contains(&oid);
            let data = match record.data {
                _ if !current => None,
                RecordData::Payload(payload) => Some(RecordData::Payload(payload)),
                // Older revisions are never carried over, so the target is always gone.
                RecordData::Backpointer(_) => {
                    match inline_payload(file, old_pos, oid, tid, end, &mut relinked)? {
                        RecordData::Backpointer(_) => None,
                        payload => Some(payload),
                    }
                }
            };
            match data {
                Some(data) => kept.push(PackRecord {
                    old_pos,
                    oid,
                    tid,
                    old_prev: 0,
                    data,
                }),
                None => stats.records_dropped += 1,
            }
        }
        if kept.is_empty() {
            stats.transactions_dropped += 1;
            continue;
        }
        let positions = writer.write_txn(&txn, TxnStatus::Packed, &kept)?;
        for (record, new_pos) in kept.iter().zip(positions) {
            index.set(record.oid, new_pos)?;
        }
    }

    let mut pos = packpos;
    while pos < end {
        let txn = read_txn(file, pos, end)?;
        pos = txn.end();
        let mut records = Vec::new();
        for record in DataRecords::new(file, &txn) {
            let record = record?;
            let (old_pos, oid, tid) = (record.pos, record.oid(), record.tid());
            let old_prev = record.header.prev;
            let data = match record.data {
                RecordData::Backpointer(back) if back != 0 => match writer.remap.get(&back) {
                    Some(&new_back) => RecordData::Backpointer(new_back),
                    None => match data_pos(file, back, end)? {
                        0 => RecordData::Backpointer(0),
                        target => match writer.remap.get(&target) {
                            Some(&new_target) => RecordData::Backpointer(new_target),
                            None => inline_payload(file, old_pos, oid, tid, end, &mut relinked)?,
                        },
                    },
                },
                data => data,
            };
            records.push(PackRecord {
                old_pos,
                oid,
                tid,
                old_prev,
                data,
            });
        }
        let positions = writer.write_txn(&txn, txn.status(), &records)?;
        if txn.status().is_visible() {
            for (record, new_pos) in records.iter().zip(positions) {
                index.set(record.oid, new_pos)?;
            }
        }
    }

    let new_end = writer.finish()?;
    stats.new_size = new_end;
    stats.oids = index.len();
    Ok(PackOutcome {
        path: pack_path.to_path_buf(),
        index,
        end: new_end,
        relinked,
        stats,
    })
}
