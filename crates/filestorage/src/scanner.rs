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

//! Positional reads over the log: transactions forwards and backwards, data records,
//! backpointer chains and per-object history.
//!
//! Nothing here takes a lock. Every read is bounded by an `end` offset captured by the caller,
//! and the log only ever grows past it, so a reader sees a stable prefix.

use crate::error::{Result, StorageError};
use crate::format::{
    DATA_HEADER_LEN, DataHeader, MAGIC, MAGIC_LEN, RecordData, TRAILER_LEN,
    TXN_HEADER_LEN, TxnHeader, TxnStatus, check_backpointer,
};
use crate::types::{Oid, Tid};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

fn read_at(file: &File, pos: u64, len: usize, end: u64) -> Result<Vec<u8>> {
    if pos.checked_add(len as u64).is_none_or(|stop| stop > end) {
        return Err(StorageError::Truncated { pos });
    }
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, pos)?;
    Ok(buf)
}

fn read_u64_at(file: &File, pos: u64, end: u64) -> Result<u64> {
    let buf = read_at(file, pos, 8, end)?;
    Ok(u64::from_be_bytes(buf.try_into().expect("eight bytes")))
}

pub fn check_magic(file: &File, end: u64) -> Result<()> {
    let magic = read_at(file, 0, MAGIC.len(), end)?;
    if magic.as_slice() != MAGIC {
        return Err(StorageError::corrupted(
            0,
            format!(
                "unrecognized file magic {:?}, expected {:?}",
                String::from_utf8_lossy(&magic),
                String::from_utf8_lossy(MAGIC)
            ),
        ));
    }
    Ok(())
}

pub fn read_txn_header(file: &File, pos: u64, end: u64) -> Result<TxnHeader> {
    let buf = read_at(file, pos, TXN_HEADER_LEN, end)?;
    TxnHeader::decode(&buf, pos)
}

/// A transaction's header and metadata, without its data records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    pub pos: u64,
    pub header: TxnHeader,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

impl TxnRecord {
    pub fn tid(&self) -> Tid {
        self.header.tid
    }

    pub fn status(&self) -> TxnStatus {
        self.header.status
    }

    /// Offset of the first data record.
    pub fn data_start(&self) -> u64 {
        self.pos + self.header.meta_len()
    }

    /// Offset just past the last data record, where the trailing length sits.
    pub fn data_end(&self) -> u64 {
        self.pos + self.header.length
    }

    /// Offset of the next transaction.
    pub fn end(&self) -> u64 {
        self.pos + self.header.total_len()
    }
}

/// Reads the complete transaction framing at `pos`: header, metadata and trailing length.
pub fn read_txn(file: &File, pos: u64, end: u64) -> Result<TxnRecord> {
    let header = read_txn_header(file, pos, end)?;
    let total = pos
        .checked_add(header.total_len())
        .ok_or(StorageError::Truncated { pos })?;
    if total > end {
        return Err(StorageError::Truncated { pos });
    }
    let trailer = read_u64_at(file, pos + header.length, end)?;
    if trailer != header.length {
        return Err(StorageError::corrupted(
            pos,
            format!(
                "trailing length {trailer} does not match header length {}",
                header.length
            ),
        ));
    }
    let meta_len = (header.meta_len() - TXN_HEADER_LEN as u64) as usize;
    let meta = read_at(file, pos + TXN_HEADER_LEN as u64, meta_len, end)?;
    let (user, rest) = meta.split_at(header.user_len as usize);
    let (description, extension) = rest.split_at(header.desc_len as usize);
    Ok(TxnRecord {
        pos,
        header,
        user: user.to_vec(),
        description: description.to_vec(),
        extension: extension.to_vec(),
    })
}

/// A data record as stored: the header plus payload or backpointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub pos: u64,
    pub header: DataHeader,
    pub data: RecordData,
}

impl DataRecord {
    pub fn oid(&self) -> Oid {
        self.header.oid
    }

    pub fn tid(&self) -> Tid {
        self.header.tid
    }

    pub fn end(&self) -> u64 {
        self.pos + self.header.record_len()
    }
}

pub fn read_data_header(file: &File, pos: u64, end: u64) -> Result<DataHeader> {
    let buf = read_at(file, pos, DATA_HEADER_LEN, end)?;
    DataHeader::decode(&buf, pos, None)
}

fn read_data_record_in(file: &File, pos: u64, end: u64, txn_pos: Option<u64>) -> Result<DataRecord> {
    let buf = read_at(file, pos, DATA_HEADER_LEN, end)?;
    let header = DataHeader::decode(&buf, pos, txn_pos)?;
    let body_pos = pos + DATA_HEADER_LEN as u64;
    let data = if header.has_backpointer() {
        let back = read_u64_at(file, body_pos, end)?;
        RecordData::Backpointer(check_backpointer(back, pos)?)
    } else {
        let len = usize::try_from(header.payload_len)
            .map_err(|_| StorageError::corrupted(pos, "payload length overflows"))?;
        RecordData::Payload(read_at(file, body_pos, len, end)?)
    };
    Ok(DataRecord { pos, header, data })
}

pub fn read_data_record(file: &File, pos: u64, end: u64) -> Result<DataRecord> {
    read_data_record_in(file, pos, end, None)
}

/// Follows backpointers from the record at `pos` to the record actually holding the payload.
/// Returns 0 when the chain ends at a "does not exist" backpointer.
pub fn data_pos(file: &File, mut pos: u64, end: u64) -> Result<u64> {
    while pos != 0 {
        let header = read_data_header(file, pos, end)?;
        if !header.has_backpointer() {
            return Ok(pos);
        }
        let back = read_u64_at(file, pos + DATA_HEADER_LEN as u64, end)?;
        pos = check_backpointer(back, pos)?;
    }
    Ok(0)
}

/// The payload visible through the record at `pos`, or `None` if the object does not exist in
/// that revision.
pub fn read_payload(file: &File, pos: u64, end: u64) -> Result<Option<Vec<u8>>> {
    match data_pos(file, pos, end)? {
        0 => Ok(None),
        p => match read_data_record(file, p, end)?.data {
            RecordData::Payload(payload) => Ok(Some(payload)),
            RecordData::Backpointer(_) => Err(StorageError::corrupted(p, "backpointer chain loops")),
        },
    }
}

/// Like [`read_payload`], but a missing object is an error.
pub fn load_back(file: &File, oid: Oid, pos: u64, end: u64) -> Result<Vec<u8>> {
    read_payload(file, pos, end)?.ok_or(StorageError::not_found(oid))
}

/// Iterates the data records of one transaction.
pub struct DataRecords<'f> {
    file: &'f File,
    txn_pos: u64,
    pos: u64,
    stop: u64,
    failed: bool,
}

impl<'f> DataRecords<'f> {
    pub fn new(file: &'f File, txn: &TxnRecord) -> Self {
        Self {
            file,
            txn_pos: txn.pos,
            pos: txn.data_start(),
            stop: txn.data_end(),
            failed: false,
        }
    }
}

impl Iterator for DataRecords<'_> {
    type Item = Result<DataRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.stop {
            return None;
        }
        match read_data_record_in(self.file, self.pos, self.stop, Some(self.txn_pos)) {
            Ok(record) => {
                self.pos = record.end();
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                // A record running past the transaction boundary is corruption of a complete
                // transaction, not a truncated file.
                Some(Err(match e {
                    StorageError::Truncated { pos } => {
                        StorageError::corrupted(pos, "data record overruns its transaction")
                    }
                    e => e,
                }))
            }
        }
    }
}

/// A committed transaction yielded by [`LogIterator`].
#[derive(Debug, Clone)]
pub struct LogTransaction {
    pub record: TxnRecord,
    file: Arc<File>,
}

impl LogTransaction {
    pub fn tid(&self) -> Tid {
        self.record.tid()
    }

    pub fn status(&self) -> TxnStatus {
        self.record.status()
    }

    pub fn user(&self) -> &[u8] {
        &self.record.user
    }

    pub fn description(&self) -> &[u8] {
        &self.record.description
    }

    pub fn extension(&self) -> &[u8] {
        &self.record.extension
    }

    /// Lazily reads this transaction's data records.
    pub fn records(&self) -> DataRecords<'_> {
        DataRecords::new(&self.file, &self.record)
    }
}

/// Forward iteration over visible transactions with `from <= tid <= to`.
///
/// Single-shot: it neither restarts nor observes transactions committed after it was created.
pub struct LogIterator {
    file: Arc<File>,
    pos: u64,
    end: u64,
    to: Option<Tid>,
    done: bool,
}

impl LogIterator {
    pub fn new(file: Arc<File>, end: u64, from: Option<Tid>, to: Option<Tid>) -> Result<Self> {
        let pos = match from {
            Some(tid) => find_txn_pos(&file, end, tid)?,
            None => MAGIC_LEN.min(end),
        };
        Ok(Self {
            file,
            pos,
            end,
            to,
            done: false,
        })
    }
}

impl Iterator for LogIterator {
    type Item = Result<LogTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.end {
            let record = match read_txn(&self.file, self.pos, self.end) {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.pos = record.end();
            if self.to.is_some_and(|to| record.tid() > to) {
                self.done = true;
                return None;
            }
            if !record.status().is_visible() {
                continue;
            }
            return Some(Ok(LogTransaction {
                record,
                file: self.file.clone(),
            }));
        }
        None
    }
}

/// Walks transactions from the end of the log towards its start using trailing lengths.
/// Yields every transaction regardless of status.
pub struct BackwardIterator<'f> {
    file: &'f File,
    pos: u64,
    end: u64,
}

impl<'f> BackwardIterator<'f> {
    pub fn new(file: &'f File, end: u64) -> Self {
        Self {
            file,
            pos: end,
            end,
        }
    }
}

impl Iterator for BackwardIterator<'_> {
    type Item = Result<TxnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos <= MAGIC_LEN {
            return None;
        }
        let result = previous_txn_pos(self.file, self.pos, self.end)
            .and_then(|pos| read_txn(self.file, pos, self.end));
        match result {
            Ok(record) => {
                self.pos = record.pos;
                Some(Ok(record))
            }
            Err(e) => {
                self.pos = 0;
                Some(Err(e))
            }
        }
    }
}

/// Start of the transaction that ends at `txn_end`.
fn previous_txn_pos(file: &File, txn_end: u64, end: u64) -> Result<u64> {
    let trailer_pos = txn_end
        .checked_sub(TRAILER_LEN as u64)
        .filter(|p| *p >= MAGIC_LEN)
        .ok_or_else(|| StorageError::corrupted(txn_end, "no trailing length before offset"))?;
    let length = read_u64_at(file, trailer_pos, end)?;
    trailer_pos
        .checked_sub(length)
        .filter(|p| *p >= MAGIC_LEN)
        .ok_or_else(|| StorageError::corrupted(trailer_pos, "trailing length points before file start"))
}

/// The complete transaction that ends exactly at `txn_end`, found through its trailing length.
pub fn txn_ending_at(file: &File, txn_end: u64, end: u64) -> Result<TxnRecord> {
    let pos = previous_txn_pos(file, txn_end, end)?;
    let record = read_txn(file, pos, end)?;
    if record.end() != txn_end {
        return Err(StorageError::corrupted(pos, "transaction does not end at the expected offset"));
    }
    Ok(record)
}

/// The tid of the transaction that ends exactly at `txn_end`.
pub fn tid_ending_at(file: &File, txn_end: u64, end: u64) -> Result<Tid> {
    Ok(txn_ending_at(file, txn_end, end)?.tid())
}

/// Offset of the first transaction whose tid is at least `tid`, or `end` if there is none.
///
/// Transaction sizes vary, so offsets can't be interpolated from tids. Instead the walk starts
/// from whichever end of the log is closer in time to `tid`.
pub fn find_txn_pos(file: &File, end: u64, tid: Tid) -> Result<u64> {
    if end <= MAGIC_LEN {
        return Ok(end);
    }
    let first = read_txn_header(file, MAGIC_LEN, end)?;
    if tid <= first.tid {
        return Ok(MAGIC_LEN);
    }
    let last_pos = previous_txn_pos(file, end, end)?;
    let last = read_txn_header(file, last_pos, end)?;
    if tid > last.tid {
        return Ok(end);
    }

    if tid.0 - first.tid.0 <= last.tid.0 - tid.0 {
        let mut pos = MAGIC_LEN;
        while pos < end {
            let header = read_txn_header(file, pos, end)?;
            if header.tid >= tid {
                return Ok(pos);
            }
            pos += header.total_len();
        }
        Ok(end)
    } else {
        let mut pos = last_pos;
        while pos > MAGIC_LEN {
            let prev = previous_txn_pos(file, pos, end)?;
            if read_txn_header(file, prev, end)?.tid < tid {
                break;
            }
            pos = prev;
        }
        Ok(pos)
    }
}

/// One revision of an object, as reported by [`history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tid: Tid,
    pub time: Option<DateTime<Utc>>,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// Size of the payload visible in this revision; zero if the object did not exist.
    pub size: u64,
}

/// Walks the revisions of one object from the record at `pos` back through `prev` links,
/// yielding each record's offset and header. Ends after the first record.
pub struct Revisions<'f> {
    file: &'f File,
    oid: Oid,
    pos: u64,
    end: u64,
}

impl<'f> Revisions<'f> {
    pub fn new(file: &'f File, oid: Oid, pos: u64, end: u64) -> Self {
        Self {
            file,
            oid,
            pos,
            end,
        }
    }
}

impl Iterator for Revisions<'_> {
    type Item = Result<(u64, DataHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == 0 {
            return None;
        }
        let pos = self.pos;
        let oid = self.oid;
        let result = read_data_header(self.file, pos, self.end).and_then(|header| {
            if header.oid == oid {
                Ok(header)
            } else {
                Err(StorageError::corrupted(
                    pos,
                    format!("revision chain of {oid} reached a record for {}", header.oid),
                ))
            }
        });
        match result {
            Ok(header) => {
                self.pos = header.prev;
                Some(Ok((pos, header)))
            }
            Err(e) => {
                self.pos = 0;
                Some(Err(e))
            }
        }
    }
}

/// Up to `size` revisions of `oid`, newest first, starting at the record at `pos`.
pub fn history(file: &File, oid: Oid, pos: u64, end: u64, size: usize) -> Result<Vec<HistoryEntry>> {
    let mut entries = Vec::new();
    for revision in Revisions::new(file, oid, pos, end).take(size) {
        let (pos, header) = revision?;
        let txn = read_txn(file, header.txn_pos, end)?;
        let size = match data_pos(file, pos, end)? {
            0 => 0,
            p => read_data_header(file, p, end)?.payload_len,
        };
        entries.push(HistoryEntry {
            tid: header.tid,
            time: header.tid.to_datetime(),
            user: txn.user,
            description: txn.description,
            extension: txn.extension,
            size,
        });
    }
    Ok(entries)
}
