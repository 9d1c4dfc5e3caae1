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

//! Bringing a log and its index to a consistent state on open, plus the offline scan and
//! verification passes used by `fsrecover`.

use crate::error::{Result, StorageError};
use crate::format::{MAGIC_LEN, RecordData, TxnStatus};
use crate::index::{FsIndex, IndexWatermark, sibling};
use crate::scanner::{
    DataRecords, check_magic, read_data_header, read_txn, read_txn_header, tid_ending_at,
    txn_ending_at,
};
use crate::types::Tid;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, info, warn};

/// Log tail that was (or, for a read-only open, would have been) cut off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub at: u64,
    pub dropped: u64,
    pub reason: String,
}

/// State recovered from the log on open.
#[derive(Debug)]
pub struct Recovered {
    pub index: FsIndex,
    /// End of the last committed transaction; the next one is written here.
    pub end: u64,
    pub last_tid: Tid,
    pub truncation: Option<Truncation>,
    /// The index was loaded from the sidecar rather than rebuilt from the start of the log.
    pub from_sidecar: bool,
    /// The sidecar already reflects `end` and needs no rewrite.
    pub sidecar_current: bool,
}

#[derive(Debug, Default)]
struct ScanStats {
    transactions: usize,
    records: usize,
}

struct ScanEnd {
    pos: u64,
    last_tid: Tid,
    damage: Option<String>,
}

/// Folds committed transactions from `pos` onwards into `index`. Stops at the first incomplete,
/// uncommitted or garbled transaction, reporting it as tail damage when it runs to the end of
/// the file. Damage with committed data after it, and structural errors inside a complete
/// transaction, are returned as errors.
fn scan_from(
    file: &File,
    mut pos: u64,
    len: u64,
    mut last_tid: Tid,
    index: &mut FsIndex,
    stats: &mut ScanStats,
) -> Result<ScanEnd> {
    while pos < len {
        let txn = match read_txn(file, pos, len) {
            Ok(txn) => txn,
            Err(e) if e.is_tail_damage() => {
                return Ok(ScanEnd {
                    pos,
                    last_tid,
                    damage: Some(confined_to_tail(file, pos, len, e.to_string())?),
                });
            }
            Err(e) => return Err(e),
        };
        if txn.status() == TxnStatus::Checkpoint {
            let reason = format!("transaction {} at offset {pos} was never committed", txn.tid());
            return Ok(ScanEnd {
                pos,
                last_tid,
                damage: Some(confined_to_tail(file, pos, len, reason)?),
            });
        }
        if txn.tid() <= last_tid {
            return Err(StorageError::corrupted(
                pos,
                format!(
                    "transaction id {} does not follow previous id {last_tid}",
                    txn.tid()
                ),
            ));
        }
        for record in DataRecords::new(file, &txn) {
            let record = record?;
            if record.tid() != txn.tid() {
                return Err(StorageError::corrupted(
                    record.pos,
                    format!("record tid {} inside transaction {}", record.tid(), txn.tid()),
                ));
            }
            if txn.status().is_visible() {
                index.set(record.oid(), record.pos)?;
            }
            stats.records += 1;
        }
        stats.transactions += 1;
        last_tid = txn.tid();
        pos = txn.end();
    }
    Ok(ScanEnd {
        pos,
        last_tid,
        damage: None,
    })
}

/// Damage found at `pos` may only be cut off if it runs to the end of the file. A complete
/// transaction framing the file end past `pos` means committed data follows, and the log is
/// `Corrupted` at `pos`.
fn confined_to_tail(file: &File, pos: u64, len: u64, reason: String) -> Result<String> {
    match txn_ending_at(file, len, len) {
        Ok(last) if last.pos > pos => Err(StorageError::corrupted(
            pos,
            format!(
                "{reason}; transaction {} at offset {} follows it",
                last.tid(),
                last.pos
            ),
        )),
        _ => Ok(reason),
    }
}

/// Whether a sidecar snapshot can be trusted as a prefix of this log.
fn sidecar_matches(file: &File, watermark: IndexWatermark, len: u64) -> bool {
    if watermark.pos < MAGIC_LEN || watermark.pos > len {
        return false;
    }
    if watermark.pos == MAGIC_LEN {
        return watermark.tid == Tid::ZERO;
    }
    if watermark.pos < len && read_txn_header(file, watermark.pos, len).is_err() {
        return false;
    }
    matches!(tid_ending_at(file, watermark.pos, len), Ok(tid) if tid == watermark.tid)
}

/// Open-time recovery: load or rebuild the index, replay the tail past its watermark, and cut
/// off any incomplete final transaction.
pub fn recover(file: &File, index_path: &Path, read_only: bool) -> Result<Recovered> {
    let len = file.metadata()?.len();
    check_magic(file, len)?;

    let (start, last_tid, mut index, from_sidecar) = match FsIndex::load(index_path) {
        Some((watermark, index)) if sidecar_matches(file, watermark, len) => {
            debug!(
                "Using index {:?} up to offset {} ({} oids)",
                index_path,
                watermark.pos,
                index.len()
            );
            (watermark.pos, watermark.tid, index, true)
        }
        Some((watermark, _)) => {
            warn!(
                "Index {:?} does not match the data file at offset {}; rebuilding",
                index_path, watermark.pos
            );
            (MAGIC_LEN, Tid::ZERO, FsIndex::new(), false)
        }
        None => (MAGIC_LEN, Tid::ZERO, FsIndex::new(), false),
    };

    let mut stats = ScanStats::default();
    let scanned = scan_from(file, start, len, last_tid, &mut index, &mut stats)?;
    let truncation = scanned.damage.map(|reason| Truncation {
        at: scanned.pos,
        dropped: len - scanned.pos,
        reason,
    });
    if let Some(truncation) = &truncation {
        if read_only {
            warn!(
                "Ignoring {} bytes past offset {} in read-only data file: {}",
                truncation.dropped, truncation.at, truncation.reason
            );
        } else {
            warn!(
                "Truncating {} bytes past offset {}: {}",
                truncation.dropped, truncation.at, truncation.reason
            );
            file.set_len(truncation.at)?;
            file.sync_all()?;
        }
    }
    if stats.transactions > 0 {
        info!(
            "Replayed {} transactions ({} records) into the index",
            stats.transactions, stats.records
        );
    }
    Ok(Recovered {
        index,
        end: scanned.pos,
        last_tid: scanned.last_tid,
        sidecar_current: from_sidecar && start == scanned.pos,
        truncation,
        from_sidecar,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Clean,
    /// The tail was damaged. With `repair` it has been cut off; otherwise it is only reported.
    Truncated(Truncation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    pub transactions: usize,
    pub records: usize,
    pub oids: usize,
    pub last_tid: Tid,
    pub end: u64,
}

/// Scans a data file from the start, ignoring any index sidecar. With `repair`, a damaged tail
/// is truncated. Corruption that truncation cannot fix is returned as an error.
pub fn scan(path: &Path, repair: bool) -> Result<RecoveryReport> {
    let file = OpenOptions::new().read(true).write(repair).open(path)?;
    let len = file.metadata()?.len();
    check_magic(&file, len)?;
    let mut index = FsIndex::new();
    let mut stats = ScanStats::default();
    let scanned = scan_from(&file, MAGIC_LEN, len, Tid::ZERO, &mut index, &mut stats)?;
    let outcome = match scanned.damage {
        None => RecoveryOutcome::Clean,
        Some(reason) => {
            let truncation = Truncation {
                at: scanned.pos,
                dropped: len - scanned.pos,
                reason,
            };
            if repair {
                warn!(
                    "Truncating {:?} at offset {}: {}",
                    path, truncation.at, truncation.reason
                );
                file.set_len(truncation.at)?;
                file.sync_all()?;
            }
            RecoveryOutcome::Truncated(truncation)
        }
    };
    Ok(RecoveryReport {
        outcome,
        transactions: stats.transactions,
        records: stats.records,
        oids: index.len(),
        last_tid: scanned.last_tid,
        end: scanned.pos,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub transactions: usize,
    pub records: usize,
    pub oids: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Read-only consistency check of a data file and, when present and current, its index.
pub fn verify(path: &Path) -> Result<VerifyReport> {
    let index_path = sibling(path, ".index");
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    check_magic(&file, len)?;

    let mut report = VerifyReport::default();
    let mut index = FsIndex::new();
    let mut oid_at: HashMap<u64, crate::types::Oid> = HashMap::new();
    let mut last_tid = Tid::ZERO;
    let mut pos = MAGIC_LEN;

    while pos < len {
        let txn = match read_txn(&file, pos, len) {
            Ok(txn) => txn,
            Err(e) => {
                report.problems.push(format!("transaction at {pos}: {e}"));
                break;
            }
        };
        if txn.status() == TxnStatus::Checkpoint {
            report
                .problems
                .push(format!("uncommitted transaction {} at {pos}", txn.tid()));
            break;
        }
        if txn.tid() <= last_tid {
            report.problems.push(format!(
                "transaction {} at {pos} does not follow {last_tid}",
                txn.tid()
            ));
        }
        last_tid = txn.tid();
        for record in DataRecords::new(&file, &txn) {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    report.problems.push(e.to_string());
                    break;
                }
            };
            report.records += 1;
            let prev = record.header.prev;
            if prev != 0 && oid_at.get(&prev) != Some(&record.oid()) {
                report.problems.push(format!(
                    "record at {} for {} has previous pointer {prev} to another object",
                    record.pos,
                    record.oid()
                ));
            }
            if let RecordData::Backpointer(back) = record.data
                && back != 0
                && oid_at.get(&back) != Some(&record.oid())
            {
                report.problems.push(format!(
                    "record at {} for {} has backpointer {back} to another object",
                    record.pos,
                    record.oid()
                ));
            }
            oid_at.insert(record.pos, record.oid());
            if txn.status().is_visible() {
                index.set(record.oid(), record.pos)?;
            }
        }
        report.transactions += 1;
        pos = txn.end();
    }
    report.oids = index.len();

    if let Some((watermark, saved)) = FsIndex::load(&index_path)
        && watermark.pos == pos
    {
        for (oid, saved_pos) in saved.iter() {
            match read_data_header(&file, saved_pos, len) {
                Ok(header) if header.oid == oid => {}
                Ok(header) => report.problems.push(format!(
                    "index maps {oid} to a record for {}",
                    header.oid
                )),
                Err(e) => report.problems.push(format!("index entry for {oid}: {e}")),
            }
        }
        if saved != index {
            report
                .problems
                .push("saved index differs from the log".to_string());
        }
    }
    Ok(report)
}
