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

//! Per-transaction state for two-phase commit: the caller-facing [`Transaction`] handle and
//! the pending transaction the storage builds up between `tpc_begin` and `tpc_finish`.

use crate::error::Result;
use crate::format::{RecordData, TXN_HEADER_LEN, encode_data_record};
use crate::types::{Oid, Tid};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

const COPY_CHUNK: usize = 64 * 1024;

/// Identifies one transaction across `tpc_begin`, `store`, `tpc_vote` and `tpc_finish`, and
/// carries the metadata recorded in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: Uuid,
    user: Vec<u8>,
    description: Vec<u8>,
    extension: Vec<u8>,
}

impl Transaction {
    pub fn new(user: impl Into<Vec<u8>>, description: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            description: description.into(),
            extension: Vec::new(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<Vec<u8>>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &[u8] {
        &self.user
    }

    pub fn description(&self) -> &[u8] {
        &self.description
    }

    pub fn extension(&self) -> &[u8] {
        &self.extension
    }

    pub(crate) fn meta_len(&self) -> u64 {
        (TXN_HEADER_LEN + self.user.len() + self.description.len() + self.extension.len()) as u64
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpcPhase {
    Active,
    Voted,
}

/// Scratch file (`data.fs.tmp`) holding the encoded data records of the pending transaction.
/// Removed when dropped.
#[derive(Debug)]
pub(crate) struct TxnBuffer {
    file: File,
    path: PathBuf,
    len: u64,
}

impl TxnBuffer {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Appends `bytes`, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let at = self.len;
        self.file.write_all_at(bytes, at)?;
        self.len += bytes.len() as u64;
        Ok(at)
    }

    #[cfg(test)]
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Copies the whole buffer into `dest` starting at `dest_pos`.
    pub fn copy_into(&self, dest: &File, dest_pos: u64) -> Result<()> {
        let mut chunk = vec![0u8; COPY_CHUNK];
        let mut offset = 0;
        while offset < self.len {
            let n = (self.len - offset).min(COPY_CHUNK as u64) as usize;
            self.file.read_exact_at(&mut chunk[..n], offset)?;
            dest.write_all_at(&chunk[..n], dest_pos + offset)?;
            offset += n as u64;
        }
        Ok(())
    }
}

impl Drop for TxnBuffer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A store whose expected tid was stale, held back until vote runs the conflict resolver.
#[derive(Debug, Clone)]
pub(crate) struct DeferredStore {
    pub oid: Oid,
    pub expected: Tid,
    pub payload: Vec<u8>,
}

/// A blob file moved into the blob directory's staging area, published at finish.
#[derive(Debug, Clone)]
pub(crate) struct StagedBlob {
    pub oid: Oid,
    pub path: PathBuf,
}

/// The transaction currently holding the commit slot.
#[derive(Debug)]
pub(crate) struct PendingTxn {
    pub txn: Transaction,
    pub tid: Tid,
    pub phase: TpcPhase,
    /// Log end when the transaction began; its header is written here.
    pub begin_pos: u64,
    pub header_written: bool,
    pub buffer: TxnBuffer,
    /// Final offsets of the records written so far, by oid.
    pub tindex: HashMap<Oid, u64>,
    pub deferred: Vec<DeferredStore>,
    pub resolved: Vec<Oid>,
    pub blobs: Vec<StagedBlob>,
    pub deadline: Option<Instant>,
}

impl PendingTxn {
    pub fn new(
        txn: Transaction,
        tid: Tid,
        begin_pos: u64,
        buffer: TxnBuffer,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            txn,
            tid,
            phase: TpcPhase::Active,
            begin_pos,
            header_written: false,
            buffer,
            tindex: HashMap::new(),
            deferred: Vec::new(),
            resolved: Vec::new(),
            blobs: Vec::new(),
            deadline,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Log offset of the first data record.
    pub fn data_start(&self) -> u64 {
        self.begin_pos + self.txn.meta_len()
    }

    /// Offset the next appended record will occupy in the log.
    pub fn next_record_pos(&self) -> u64 {
        self.data_start() + self.buffer.len()
    }

    /// Encodes a record for `oid` at its final log position and buffers it.
    pub fn append_record(&mut self, oid: Oid, prev: u64, data: &RecordData) -> Result<u64> {
        let pos = self.next_record_pos();
        let record = encode_data_record(oid, self.tid, prev, self.begin_pos, data);
        self.buffer.append(&record)?;
        self.tindex.insert(oid, pos);
        Ok(pos)
    }

    /// Transaction length as recorded in the header and trailer.
    pub fn length(&self) -> u64 {
        self.txn.meta_len() + self.buffer.len()
    }

    /// Log end once this transaction is written.
    pub fn end(&self) -> u64 {
        self.begin_pos + self.length() + 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DATA_HEADER_LEN, DataHeader};
    use tempfile::TempDir;

    #[test]
    fn test_transaction_metadata() {
        let a = Transaction::new("alice", "first").with_extension(b"{}".to_vec());
        let b = Transaction::new("alice", "first");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.user(), b"alice");
        assert_eq!(a.extension(), b"{}");
        assert_eq!(a.meta_len(), (TXN_HEADER_LEN + 5 + 5 + 2) as u64);
    }

    #[test]
    fn test_buffer_append_and_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs.tmp");
        let mut buffer = TxnBuffer::create(&path).unwrap();
        assert_eq!(buffer.append(b"hello").unwrap(), 0);
        assert_eq!(buffer.append(b" world").unwrap(), 5);
        assert_eq!(buffer.read(6, 5).unwrap(), b"world");

        let dest = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(dir.path().join("dest"))
            .unwrap();
        buffer.copy_into(&dest, 3).unwrap();
        let mut out = vec![0u8; 11];
        dest.read_exact_at(&mut out, 3).unwrap();
        assert_eq!(out, b"hello world");

        drop(buffer);
        assert!(!path.exists());
    }

    #[test]
    fn test_records_land_at_final_offsets() {
        let dir = TempDir::new().unwrap();
        let buffer = TxnBuffer::create(&dir.path().join("data.fs.tmp")).unwrap();
        let txn = Transaction::new("u", "d");
        let mut pending = PendingTxn::new(txn, Tid(7), 100, buffer, None);
        let first = pending
            .append_record(Oid(1), 0, &RecordData::Payload(b"abc".to_vec()))
            .unwrap();
        assert_eq!(first, 100 + TXN_HEADER_LEN as u64 + 2);
        let second = pending
            .append_record(Oid(2), 50, &RecordData::Backpointer(60))
            .unwrap();
        assert_eq!(second, first + DATA_HEADER_LEN as u64 + 3);
        assert_eq!(pending.tindex.get(&Oid(2)), Some(&second));

        let raw = pending
            .buffer
            .read(second - pending.data_start(), DATA_HEADER_LEN)
            .unwrap();
        let header = DataHeader::decode(&raw, second, Some(100)).unwrap();
        assert_eq!(header.oid, Oid(2));
        assert_eq!(header.tid, Tid(7));
        assert_eq!(header.prev, 50);
        assert!(header.has_backpointer());
        assert_eq!(pending.end(), pending.begin_pos + pending.length() + 8);
    }

    #[test]
    fn test_deadline() {
        let dir = TempDir::new().unwrap();
        let buffer = TxnBuffer::create(&dir.path().join("data.fs.tmp")).unwrap();
        let now = Instant::now();
        let pending = PendingTxn::new(Transaction::new("", ""), Tid(1), 4, buffer, Some(now));
        assert!(pending.is_expired(now));
        assert!(!PendingTxn {
            deadline: None,
            ..pending
        }
        .is_expired(now));
    }
}
