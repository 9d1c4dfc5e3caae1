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

//! The storage itself: a single append-only log file, its in-memory index, and the two-phase
//! commit protocol that appends to it.
//!
//! Writers are serialized through a commit slot: from `tpc_begin` to `tpc_finish` (or
//! `tpc_abort`) exactly one transaction, or a pack, owns the end of the log. Readers never
//! wait on the slot. They take the read lock just long enough to copy the file handle, the
//! index entry and the committed end offset, then read positionally. Committed bytes are
//! never rewritten in place, so a reader's view stays valid even while the next transaction
//! is being voted.

use crate::blob::BlobStore;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::format::{MAGIC, RecordData, STATUS_OFFSET, TxnStatus, encode_txn_meta};
use crate::index::{FsIndex, IndexWatermark, sibling};
use crate::lock::LockFile;
use crate::pack::{FileStoragePacker, PackSource, PackStats, Packer};
use crate::recovery::recover;
use crate::scanner::{
    BackwardIterator, DataRecords, HistoryEntry, LogIterator, Revisions, data_pos,
    find_txn_pos, history, load_back, read_data_header, read_data_record, read_payload,
    read_txn,
};
use crate::tpc::{DeferredStore, PendingTxn, StagedBlob, TpcPhase, Transaction, TxnBuffer};
use crate::types::{Oid, Tid};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Merges concurrent changes to one object. Given the revision the writer started from
/// (`old`, absent for a new object), the revision committed since (`saved`) and the writer's
/// new state, returns the merged state, or `None` if the changes cannot be reconciled.
///
/// Runs while the commit slot is held, so it must be quick and free of side effects.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, oid: Oid, old: Option<&[u8]>, saved: &[u8], new: &[u8]) -> Option<Vec<u8>>;
}

impl<F> ConflictResolver for F
where
    F: Fn(Oid, Option<&[u8]>, &[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn resolve(&self, oid: Oid, old: Option<&[u8]>, saved: &[u8], new: &[u8]) -> Option<Vec<u8>> {
        self(oid, old, saved, new)
    }
}

/// One undoable transaction, as listed by [`FileStorage::undo_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoInfo {
    pub tid: Tid,
    pub time: Option<DateTime<Utc>>,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

/// A payload with the revision that wrote it and, if it has since been replaced, the revision
/// that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub payload: Vec<u8>,
    pub tid: Tid,
    pub end_tid: Option<Tid>,
}

/// What readers see: the committed prefix of the log.
struct ReadState {
    file: Arc<File>,
    index: FsIndex,
    last_tid: Tid,
    end: u64,
}

enum CommitSlot {
    Idle,
    Active(Box<PendingTxn>),
    Packing,
}

pub struct FileStorage {
    path: PathBuf,
    index_path: PathBuf,
    tmp_path: PathBuf,
    config: StorageConfig,
    state: RwLock<ReadState>,
    slot: Mutex<CommitSlot>,
    slot_freed: Condvar,
    /// Highest oid handed out or stored so far.
    max_oid: AtomicU64,
    /// Set when a commit failed after its status flip; the storage is read-only from then on.
    failed: AtomicBool,
    resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
    packer: RwLock<Arc<dyn Packer>>,
    blobs: Option<BlobStore>,
    _lock: Option<LockFile>,
}

impl FileStorage {
    /// Opens (or with `create`, initializes) the log at `path`, recovering from any crash
    /// that interrupted the last commit.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index_path = sibling(&path, ".index");
        if config.read_only && config.create {
            return Err(StorageError::ReadOnly);
        }

        let lock = if config.read_only {
            None
        } else {
            Some(LockFile::acquire(&sibling(&path, ".lock"))?)
        };
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(config.create)
            .open(&path)?;
        if config.create {
            file.set_len(0)?;
            file.write_all_at(MAGIC, 0)?;
            file.sync_all()?;
            if let Err(e) = fs::remove_file(&index_path)
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        } else if file.metadata()?.len() == 0 {
            return Err(StorageError::corrupted(0, "data file is empty"));
        }

        let recovered = recover(&file, &index_path, config.read_only)?;
        if !config.read_only && !recovered.sidecar_current {
            recovered.index.save(
                &index_path,
                IndexWatermark {
                    pos: recovered.end,
                    tid: recovered.last_tid,
                },
            )?;
        }
        let blobs = config.blob_dir.as_deref().map(BlobStore::open).transpose()?;
        info!(
            "Opened {:?}{}: {} objects, {} bytes, last transaction {}",
            path,
            if config.read_only { " read-only" } else { "" },
            recovered.index.len(),
            recovered.end,
            recovered.last_tid
        );

        Ok(Self {
            tmp_path: sibling(&path, ".tmp"),
            max_oid: AtomicU64::new(recovered.index.max_key().map_or(0, |oid| oid.0)),
            state: RwLock::new(ReadState {
                file: Arc::new(file),
                index: recovered.index,
                last_tid: recovered.last_tid,
                end: recovered.end,
            }),
            slot: Mutex::new(CommitSlot::Idle),
            slot_freed: Condvar::new(),
            failed: AtomicBool::new(false),
            resolver: RwLock::new(None),
            packer: RwLock::new(Arc::new(FileStoragePacker)),
            blobs,
            _lock: lock,
            path,
            index_path,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only || self.failed.load(Ordering::SeqCst)
    }

    pub fn set_conflict_resolver(&self, resolver: impl ConflictResolver + 'static) {
        *self.resolver.write() = Some(Arc::new(resolver));
    }

    pub fn set_packer(&self, packer: impl Packer + 'static) {
        *self.packer.write() = Arc::new(packer);
    }

    /// Tid of the most recent committed transaction, or zero for an empty log.
    pub fn last_transaction(&self) -> Tid {
        self.state.read().last_tid
    }

    /// Number of objects with a current record.
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }

    /// Size in bytes of the committed log.
    pub fn size(&self) -> u64 {
        self.state.read().end
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Marks the storage read-only after a failure that left the log in doubt.
    fn fail(&self, context: &str, e: &io::Error) {
        error!("{context} failed on {:?}: {e}; storage is now read-only", self.path);
        self.failed.store(true, Ordering::SeqCst);
    }

    /// The log file, committed end, and current record offset of `oid`.
    fn lookup(&self, oid: Oid) -> Option<(Arc<File>, u64, u64)> {
        let state = self.state.read();
        let pos = state.index.get(oid)?;
        Some((state.file.clone(), state.end, pos))
    }

    /// Offset and tid of the current record of `oid`; zeros if it has none.
    fn current(&self, oid: Oid) -> Result<(u64, Tid)> {
        match self.lookup(oid) {
            None => Ok((0, Tid::ZERO)),
            Some((file, end, pos)) => Ok((pos, read_data_header(&file, pos, end)?.tid)),
        }
    }

    /// The current state of `oid` and the tid that wrote it.
    pub fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let (file, end, pos) = self.lookup(oid).ok_or(StorageError::not_found(oid))?;
        let tid = read_data_header(&file, pos, end)?.tid;
        Ok((load_back(&file, oid, pos, end)?, tid))
    }

    /// The state of `oid` as of `at`: its newest revision with a tid no later than `at`.
    /// `None` if the object did not exist then.
    pub fn load_at(&self, oid: Oid, at: Tid) -> Result<Option<(Vec<u8>, Tid)>> {
        let Some((file, end, pos)) = self.lookup(oid) else {
            return Ok(None);
        };
        for revision in Revisions::new(&file, oid, pos, end) {
            let (pos, header) = revision?;
            if header.tid <= at {
                return Ok(read_payload(&file, pos, end)?.map(|payload| (payload, header.tid)));
            }
        }
        Ok(None)
    }

    /// The revision of `oid` current just before `before`, with the tid that replaced it.
    pub fn load_before(&self, oid: Oid, before: Tid) -> Result<Option<Revision>> {
        let Some((file, end, pos)) = self.lookup(oid) else {
            return Ok(None);
        };
        let mut end_tid = None;
        for revision in Revisions::new(&file, oid, pos, end) {
            let (pos, header) = revision?;
            if header.tid < before {
                return Ok(read_payload(&file, pos, end)?.map(|payload| Revision {
                    payload,
                    tid: header.tid,
                    end_tid,
                }));
            }
            end_tid = Some(header.tid);
        }
        Ok(None)
    }

    /// Exactly the revision of `oid` written by `tid`.
    pub fn load_serial(&self, oid: Oid, tid: Tid) -> Result<Vec<u8>> {
        let missing = StorageError::KeyNotFound { oid, tid: Some(tid) };
        let (file, end, pos) = self.lookup(oid).ok_or(missing)?;
        let pos = revision_pos(&file, oid, pos, end, tid)?;
        read_payload(&file, pos, end)?.ok_or(StorageError::KeyNotFound { oid, tid: Some(tid) })
    }

    /// A fresh oid, above every oid handed out or stored before.
    pub fn new_oid(&self) -> Oid {
        Oid(self.max_oid.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn history(&self, oid: Oid, size: usize) -> Result<Vec<HistoryEntry>> {
        let (file, end, pos) = self.lookup(oid).ok_or(StorageError::not_found(oid))?;
        history(&file, oid, pos, end, size)
    }

    /// Undoable transactions, newest first, skipping the first `first` and stopping before
    /// the `last`th. Packed history cannot be undone and ends the listing.
    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoInfo>> {
        let (file, end) = {
            let state = self.state.read();
            (state.file.clone(), state.end)
        };
        let mut entries = Vec::new();
        let mut seen = 0;
        for txn in BackwardIterator::new(&file, end) {
            let txn = txn?;
            match txn.status() {
                TxnStatus::Packed => break,
                TxnStatus::Committed => {}
                TxnStatus::Undone | TxnStatus::Checkpoint => continue,
            }
            if seen >= last {
                break;
            }
            if seen >= first {
                entries.push(UndoInfo {
                    tid: txn.tid(),
                    time: txn.tid().to_datetime(),
                    user: txn.user,
                    description: txn.description,
                    extension: txn.extension,
                });
            }
            seen += 1;
        }
        Ok(entries)
    }

    /// Iterates committed transactions with tids in `from..=to`, as of now.
    pub fn iterator(&self, from: Option<Tid>, to: Option<Tid>) -> Result<LogIterator> {
        let (file, end) = {
            let state = self.state.read();
            (state.file.clone(), state.end)
        };
        LogIterator::new(file, end, from, to)
    }

    /// Starts a transaction, waiting for the commit slot if another transaction or a pack
    /// holds it.
    pub fn tpc_begin(&self, txn: &Transaction) -> Result<()> {
        self.check_writable()?;
        encode_txn_meta(
            Tid::ZERO,
            0,
            TxnStatus::Checkpoint,
            txn.user(),
            txn.description(),
            txn.extension(),
        )?;

        let mut slot = self.slot.lock();
        self.wait_for_slot(&mut slot, Some(txn))?;
        self.check_writable()?;

        let (end, last_tid) = {
            let state = self.state.read();
            (state.end, state.last_tid)
        };
        let tid = Tid::next_after(last_tid).ok_or_else(|| {
            StorageError::TpcState(format!("no transaction id left after {last_tid}"))
        })?;
        let buffer = TxnBuffer::create(&self.tmp_path)?;
        let deadline = self
            .config
            .transaction_timeout
            .map(|timeout| Instant::now() + timeout);
        debug!("Transaction {} began as {tid} at offset {end}", txn.id());
        *slot = CommitSlot::Active(Box::new(PendingTxn::new(
            txn.clone(),
            tid,
            end,
            buffer,
            deadline,
        )));
        Ok(())
    }

    /// Blocks until the commit slot is idle. An occupant past its deadline is aborted.
    fn wait_for_slot(
        &self,
        slot: &mut MutexGuard<'_, CommitSlot>,
        txn: Option<&Transaction>,
    ) -> Result<()> {
        loop {
            let (expired, wait_until) = match &**slot {
                CommitSlot::Idle => return Ok(()),
                CommitSlot::Active(pending)
                    if txn.is_some_and(|txn| txn.id() == pending.txn.id()) =>
                {
                    return Err(StorageError::TpcState(format!(
                        "transaction {} has already begun",
                        pending.txn.id()
                    )));
                }
                CommitSlot::Active(pending) => (
                    pending
                        .is_expired(Instant::now())
                        .then(|| pending.txn.id()),
                    pending.deadline,
                ),
                CommitSlot::Packing => (None, None),
            };
            if let Some(id) = expired {
                warn!("Transaction {id} exceeded its timeout; aborting it");
                self.abort_slot(slot)?;
                continue;
            }
            match wait_until {
                Some(deadline) => {
                    self.slot_freed.wait_until(slot, deadline);
                }
                None => self.slot_freed.wait(slot),
            }
        }
    }

    /// Discards whatever occupies the slot and wakes waiters.
    fn abort_slot(&self, slot: &mut CommitSlot) -> Result<()> {
        let result = match std::mem::replace(slot, CommitSlot::Idle) {
            CommitSlot::Active(pending) => self.discard(*pending),
            _ => Ok(()),
        };
        self.slot_freed.notify_all();
        result
    }

    /// Rolls back a pending transaction: staged blobs are removed and anything written to
    /// the log is cut off again.
    fn discard(&self, pending: PendingTxn) -> Result<()> {
        if let Some(blobs) = &self.blobs {
            for blob in &pending.blobs {
                blobs.discard(&blob.path);
            }
        }
        if pending.header_written {
            let file = self.state.read().file.clone();
            if let Err(e) = file.set_len(pending.begin_pos) {
                self.fail("Truncating an aborted transaction", &e);
                return Err(e.into());
            }
        }
        debug!("Transaction {} aborted", pending.txn.id());
        Ok(())
    }

    /// The pending transaction owned by `txn`. A transaction past its deadline is aborted.
    fn pending_mut<'a>(
        &self,
        slot: &'a mut CommitSlot,
        txn: &Transaction,
    ) -> Result<&'a mut PendingTxn> {
        let expired = match &*slot {
            CommitSlot::Active(pending) if pending.txn.id() == txn.id() => {
                pending.is_expired(Instant::now())
            }
            _ => return Err(not_in_progress(txn)),
        };
        if expired {
            warn!("Transaction {} exceeded its timeout; aborting it", txn.id());
            self.abort_slot(slot)?;
            return Err(StorageError::TpcState(format!(
                "transaction {} timed out and was aborted",
                txn.id()
            )));
        }
        match slot {
            CommitSlot::Active(pending) => Ok(&mut **pending),
            _ => Err(not_in_progress(txn)),
        }
    }

    /// Runs `f` on the pending transaction of `txn`, which must not have voted yet.
    fn with_active<T>(
        &self,
        txn: &Transaction,
        f: impl FnOnce(&mut PendingTxn) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let mut slot = self.slot.lock();
        let pending = self.pending_mut(&mut slot, txn)?;
        if pending.phase != TpcPhase::Active {
            return Err(StorageError::TpcState(format!(
                "transaction {} has already voted",
                txn.id()
            )));
        }
        f(pending)
    }

    /// Writes a new revision of `oid` within `txn`. `expected` must be the tid of the current
    /// revision (zero for a new object). A mismatch is a conflict, which is deferred to vote
    /// when a conflict resolver is installed.
    pub fn store(&self, oid: Oid, expected: Tid, payload: Vec<u8>, txn: &Transaction) -> Result<()> {
        if payload.is_empty() {
            return Err(StorageError::EmptyPayload { oid });
        }
        self.with_active(txn, |pending| {
            let (prev, current) = self.current(oid)?;
            self.max_oid.fetch_max(oid.0, Ordering::SeqCst);
            if current != expected {
                if self.resolver.read().is_some() {
                    pending.deferred.push(DeferredStore {
                        oid,
                        expected,
                        payload,
                    });
                    return Ok(());
                }
                return Err(StorageError::Conflict {
                    oid,
                    expected,
                    current,
                });
            }
            pending.append_record(oid, prev, &RecordData::Payload(payload))?;
            Ok(())
        })
    }

    /// Like [`store`](Self::store), also taking ownership of `blob_file` as the object's blob.
    /// Blob conflicts are never resolved.
    pub fn store_blob(
        &self,
        oid: Oid,
        expected: Tid,
        payload: Vec<u8>,
        blob_file: &Path,
        txn: &Transaction,
    ) -> Result<()> {
        let blobs = self.blobs.as_ref().ok_or_else(|| {
            StorageError::Unsupported("no blob directory is configured".to_string())
        })?;
        if payload.is_empty() {
            return Err(StorageError::EmptyPayload { oid });
        }
        self.with_active(txn, |pending| {
            let (prev, current) = self.current(oid)?;
            if current != expected {
                return Err(StorageError::Conflict {
                    oid,
                    expected,
                    current,
                });
            }
            self.max_oid.fetch_max(oid.0, Ordering::SeqCst);
            let staged = blobs.stage(blob_file)?;
            pending.blobs.push(StagedBlob { oid, path: staged });
            pending.append_record(oid, prev, &RecordData::Payload(payload))?;
            Ok(())
        })
    }

    /// Path of the blob stored with revision `tid` of `oid`.
    pub fn load_blob(&self, oid: Oid, tid: Tid) -> Result<PathBuf> {
        let blobs = self.blobs.as_ref().ok_or_else(|| {
            StorageError::Unsupported("no blob directory is configured".to_string())
        })?;
        let missing = StorageError::KeyNotFound { oid, tid: Some(tid) };
        let (file, end, pos) = self.lookup(oid).ok_or(missing)?;
        let pos = revision_pos(&file, oid, pos, end, tid)?;
        // Undo records point at the revision that actually carries the blob.
        match data_pos(&file, pos, end)? {
            0 => Err(StorageError::KeyNotFound { oid, tid: Some(tid) }),
            payload_pos => blobs.load(oid, read_data_header(&file, payload_pos, end)?.tid),
        }
    }

    /// Reverts, within `txn`, every object the transaction `target` changed to its state
    /// before `target`. Objects changed again since are merged with the conflict resolver or
    /// the undo fails. Nothing is written unless every object can be undone. Returns the
    /// undone oids.
    pub fn undo(&self, target: Tid, txn: &Transaction) -> Result<Vec<Oid>> {
        self.with_active(txn, |pending| {
            let (file, end) = {
                let state = self.state.read();
                (state.file.clone(), state.end)
            };
            let txn_pos = find_txn_pos(&file, end, target)?;
            let record = match read_txn(&file, txn_pos, end) {
                Ok(record) if txn_pos < end && record.tid() == target => record,
                _ => {
                    return Err(StorageError::undo(
                        None,
                        format!("no transaction with tid {target}"),
                    ));
                }
            };
            if record.status() != TxnStatus::Committed {
                return Err(StorageError::undo(
                    None,
                    format!("transaction {target} cannot be undone"),
                ));
            }

            let mut order = Vec::new();
            let mut last_record = HashMap::new();
            for data in DataRecords::new(&file, &record) {
                let data = data?;
                if last_record.insert(data.oid(), data.pos).is_none() {
                    order.push(data.oid());
                }
            }

            let resolver = self.resolver.read().clone();
            let mut planned = Vec::with_capacity(order.len());
            for oid in &order {
                let oid = *oid;
                if pending.tindex.contains_key(&oid) || pending.deferred.iter().any(|d| d.oid == oid)
                {
                    return Err(StorageError::undo(
                        Some(oid),
                        "already modified in this transaction",
                    ));
                }
                let undone_pos = last_record[&oid];
                let before = state_before(&file, undone_pos, txn_pos, end)?;
                let current_pos = self
                    .lookup(oid)
                    .map(|(_, _, pos)| pos)
                    .ok_or_else(|| StorageError::undo(Some(oid), "object has no current record"))?;
                let undone_data = data_pos(&file, undone_pos, end)?;
                if current_pos == undone_pos || data_pos(&file, current_pos, end)? == undone_data {
                    planned.push((oid, current_pos, RecordData::Backpointer(before)));
                    continue;
                }
                let merged = match &resolver {
                    Some(resolver) => {
                        let undone = read_payload(&file, undone_data, end)?;
                        let saved = read_payload(&file, current_pos, end)?;
                        let restored = read_payload(&file, before, end)?;
                        match (saved, restored) {
                            (Some(saved), Some(restored)) => {
                                resolver.resolve(oid, undone.as_deref(), &saved, &restored)
                            }
                            _ => None,
                        }
                    }
                    None => None,
                };
                match merged {
                    Some(merged) if !merged.is_empty() => {
                        planned.push((oid, current_pos, RecordData::Payload(merged)));
                    }
                    _ => {
                        return Err(StorageError::undo(
                            Some(oid),
                            format!("modified after transaction {target}"),
                        ));
                    }
                }
            }

            for (oid, prev, data) in &planned {
                pending.append_record(*oid, *prev, data)?;
            }
            debug!("Transaction {} undoes {target}: {:?}", txn.id(), order);
            Ok(order)
        })
    }

    /// First commit phase: resolves deferred conflicts, checks the quota, and writes the
    /// transaction to the end of the log with checkpoint status. Returns the oids whose
    /// payload the conflict resolver replaced. On failure the transaction is aborted.
    pub fn tpc_vote(&self, txn: &Transaction) -> Result<Vec<Oid>> {
        self.check_writable()?;
        let mut slot = self.slot.lock();
        let pending = self.pending_mut(&mut slot, txn)?;
        if pending.phase != TpcPhase::Active {
            return Err(StorageError::TpcState(format!(
                "transaction {} has already voted",
                txn.id()
            )));
        }
        match self.vote(pending) {
            Ok(resolved) => {
                pending.phase = TpcPhase::Voted;
                Ok(resolved)
            }
            Err(e) => {
                warn!("Vote of transaction {} failed: {e}", txn.id());
                self.abort_slot(&mut slot)?;
                Err(e)
            }
        }
    }

    fn vote(&self, pending: &mut PendingTxn) -> Result<Vec<Oid>> {
        let resolver = self.resolver.read().clone();
        for deferred in std::mem::take(&mut pending.deferred) {
            let (prev, current) = self.current(deferred.oid)?;
            let payload = if current == deferred.expected {
                deferred.payload
            } else {
                let merged = match (&resolver, self.lookup(deferred.oid)) {
                    (Some(resolver), Some((file, end, pos))) => {
                        let old = match deferred.expected {
                            Tid::ZERO => None,
                            expected => {
                                let old_pos = revision_pos(&file, deferred.oid, pos, end, expected)?;
                                read_payload(&file, old_pos, end)?
                            }
                        };
                        read_payload(&file, pos, end)?.and_then(|saved| {
                            resolver.resolve(deferred.oid, old.as_deref(), &saved, &deferred.payload)
                        })
                    }
                    _ => None,
                };
                match merged {
                    Some(merged) if !merged.is_empty() => {
                        pending.resolved.push(deferred.oid);
                        merged
                    }
                    _ => {
                        return Err(StorageError::Conflict {
                            oid: deferred.oid,
                            expected: deferred.expected,
                            current,
                        });
                    }
                }
            };
            pending.append_record(deferred.oid, prev, &RecordData::Payload(payload))?;
        }

        let requested = pending.end();
        if self.config.quota > 0 && requested > self.config.quota {
            return Err(StorageError::Quota {
                quota: self.config.quota,
                requested,
            });
        }

        let meta = encode_txn_meta(
            pending.tid,
            pending.length(),
            TxnStatus::Checkpoint,
            pending.txn.user(),
            pending.txn.description(),
            pending.txn.extension(),
        )?;
        let file = self.state.read().file.clone();
        pending.header_written = true;
        file.write_all_at(&meta, pending.begin_pos)?;
        pending.buffer.copy_into(&file, pending.data_start())?;
        file.write_all_at(
            &pending.length().to_be_bytes(),
            pending.begin_pos + pending.length(),
        )?;
        debug!(
            "Transaction {} voted: {} records, {} bytes at offset {}",
            pending.txn.id(),
            pending.tindex.len(),
            pending.length(),
            pending.begin_pos
        );
        Ok(pending.resolved.clone())
    }

    /// Second commit phase: marks the voted transaction committed, makes it durable and
    /// visible, and frees the commit slot. Returns the transaction's tid.
    pub fn tpc_finish(&self, txn: &Transaction) -> Result<Tid> {
        self.check_writable()?;
        let mut slot = self.slot.lock();
        if self.pending_mut(&mut slot, txn)?.phase != TpcPhase::Voted {
            return Err(StorageError::TpcState(format!(
                "transaction {} has not voted",
                txn.id()
            )));
        }
        let CommitSlot::Active(pending) = std::mem::replace(&mut *slot, CommitSlot::Idle) else {
            return Err(not_in_progress(txn));
        };
        let result = self.finish(*pending);
        self.slot_freed.notify_all();
        result
    }

    fn finish(&self, pending: PendingTxn) -> Result<Tid> {
        let tid = pending.tid;
        let published = match self.publish_blobs(&pending) {
            Ok(published) => published,
            Err(e) => {
                self.discard(pending)?;
                return Err(e);
            }
        };

        let file = self.state.read().file.clone();
        let status_pos = pending.begin_pos + STATUS_OFFSET;
        if let Err(e) = file.write_all_at(&[TxnStatus::Committed.as_byte()], status_pos) {
            for path in &published {
                let _ = fs::remove_file(path);
            }
            self.discard(pending)?;
            return Err(e.into());
        }
        if let Err(e) = file.sync_data() {
            self.fail("Syncing a committed transaction", &e);
            return Err(e.into());
        }

        let mut state = self.state.write();
        if let Err(e) = state
            .index
            .update(pending.tindex.iter().map(|(oid, pos)| (*oid, *pos)))
        {
            error!("Transaction {tid} is durable but could not be indexed: {e}; storage is now read-only");
            self.failed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        state.end = pending.end();
        state.last_tid = tid;
        debug!(
            "Transaction {} committed as {tid}: {} objects",
            pending.txn.id(),
            pending.tindex.len()
        );
        Ok(tid)
    }

    fn publish_blobs(&self, pending: &PendingTxn) -> Result<Vec<PathBuf>> {
        let Some(blobs) = &self.blobs else {
            return Ok(Vec::new());
        };
        let mut published = Vec::with_capacity(pending.blobs.len());
        for staged in &pending.blobs {
            match blobs.publish(&staged.path, staged.oid, pending.tid) {
                Ok(path) => published.push(path),
                Err(e) => {
                    for path in &published {
                        let _ = fs::remove_file(path);
                    }
                    return Err(e);
                }
            }
        }
        Ok(published)
    }

    /// Abandons `txn`, truncating anything it wrote. A no-op unless `txn` holds the slot.
    pub fn tpc_abort(&self, txn: &Transaction) -> Result<()> {
        let mut slot = self.slot.lock();
        let owned = matches!(&*slot, CommitSlot::Active(pending) if pending.txn.id() == txn.id());
        if owned {
            self.abort_slot(&mut slot)
        } else {
            Ok(())
        }
    }

    /// Rewrites the log without history before `cutoff`, dropping objects unreachable from
    /// the root when `pack_gc` is set. Returns `None` if nothing was at or before the cutoff.
    pub fn pack(&self, cutoff: Tid, refs_of: impl Fn(&[u8]) -> Vec<Oid>) -> Result<Option<PackStats>> {
        self.check_writable()?;
        {
            let mut slot = self.slot.lock();
            self.wait_for_slot(&mut slot, None)?;
            *slot = CommitSlot::Packing;
        }
        let result = self.pack_locked(cutoff, &refs_of);
        let mut slot = self.slot.lock();
        *slot = CommitSlot::Idle;
        self.slot_freed.notify_all();
        result
    }

    fn pack_locked(&self, cutoff: Tid, refs_of: &dyn Fn(&[u8]) -> Vec<Oid>) -> Result<Option<PackStats>> {
        let started = minstant::Instant::now();
        let (file, end, oids_before) = {
            let state = self.state.read();
            (state.file.clone(), state.end, state.index.len())
        };
        let packer = self.packer.read().clone();
        let source = PackSource {
            path: &self.path,
            file: &file,
            end,
            cutoff,
            gc: self.config.pack_gc,
            refs_of,
        };
        let packed = packer.pack(&source);
        if let Err(e) = &packed {
            error!("Packing {:?} failed: {e}", self.path);
            let pack_path = sibling(&self.path, ".pack");
            if let Err(e) = fs::remove_file(&pack_path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Unable to remove partial pack file {:?}: {e}", pack_path);
            }
        }
        let Some(outcome) = packed? else {
            info!("Nothing in {:?} at or before {cutoff} to pack", self.path);
            return Ok(None);
        };

        let swapped = self.swap_in(&outcome.path);
        if let Err(e) = &swapped {
            error!("Unable to install packed file {:?}: {e}", outcome.path);
            let _ = fs::remove_file(&outcome.path);
        }
        let new_file = swapped?;

        let last_tid = {
            let mut state = self.state.write();
            state.file = Arc::new(new_file);
            state.index = outcome.index;
            state.end = outcome.end;
            state
                .index
                .save(
                    &self.index_path,
                    IndexWatermark {
                        pos: outcome.end,
                        tid: last_tid_of(&state.file, outcome.end)?,
                    },
                )?;
            state.last_tid
        };

        if let Some(blobs) = &self.blobs {
            for relink in &outcome.relinked {
                blobs.relink(relink.oid, relink.from, relink.to)?;
            }
            let keep = self.blob_revisions()?;
            blobs.prune(&keep)?;
        }

        let stats = outcome.stats;
        info!(
            "Packed {:?} up to {} in {:?}: {} -> {} bytes, {} objects removed, last transaction {}",
            self.path,
            stats.packed_tid,
            started.elapsed(),
            stats.old_size,
            stats.new_size,
            oids_before.saturating_sub(stats.oids),
            last_tid
        );
        Ok(Some(stats))
    }

    /// Renames the packed file over the live one, keeping the old generation if configured,
    /// and opens the result.
    fn swap_in(&self, pack_path: &Path) -> Result<File> {
        if self.config.pack_keep_old {
            let old_path = sibling(&self.path, ".old");
            if let Err(e) = fs::remove_file(&old_path)
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
            fs::hard_link(&self.path, &old_path)?;
        }
        fs::rename(pack_path, &self.path)?;
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    /// Every (oid, tid) whose record carries a payload, i.e. every revision a blob may be
    /// stored under.
    fn blob_revisions(&self) -> Result<HashSet<(Oid, Tid)>> {
        let mut keep = HashSet::new();
        for txn in self.iterator(None, None)? {
            for record in txn?.records() {
                let record = record?;
                if !record.header.has_backpointer() {
                    keep.insert((record.oid(), record.tid()));
                }
            }
        }
        Ok(keep)
    }

    /// Aborts any transaction in progress and saves the index, so the next open need not
    /// scan the log.
    pub fn close(self) -> Result<()> {
        {
            let mut slot = self.slot.lock();
            if matches!(&*slot, CommitSlot::Active(_)) {
                warn!("Closing {:?} with a transaction in progress; aborting it", self.path);
                self.abort_slot(&mut slot)?;
            }
        }
        if self.is_read_only() {
            return Ok(());
        }
        let state = self.state.read();
        state.index.save(
            &self.index_path,
            IndexWatermark {
                pos: state.end,
                tid: state.last_tid,
            },
        )?;
        info!("Closed {:?} at offset {}", self.path, state.end);
        Ok(())
    }
}

fn not_in_progress(txn: &Transaction) -> StorageError {
    StorageError::TpcState(format!("transaction {} is not in progress", txn.id()))
}

/// Offset of the revision of `oid` written by `tid`, searching back from `pos`.
fn revision_pos(file: &File, oid: Oid, pos: u64, end: u64, tid: Tid) -> Result<u64> {
    for revision in Revisions::new(file, oid, pos, end) {
        let (pos, header) = revision?;
        if header.tid == tid {
            return Ok(pos);
        }
        if header.tid < tid {
            break;
        }
    }
    Err(StorageError::KeyNotFound { oid, tid: Some(tid) })
}

/// The payload offset of an object's state just before the transaction at `txn_pos` wrote the
/// record at `pos`; zero if the object did not exist.
fn state_before(file: &File, pos: u64, txn_pos: u64, end: u64) -> Result<u64> {
    let mut prev = read_data_header(file, pos, end)?.prev;
    while prev != 0 {
        let record = read_data_record(file, prev, end)?;
        if record.header.txn_pos != txn_pos {
            break;
        }
        prev = record.header.prev;
    }
    data_pos(file, prev, end)
}

/// Tid of the last transaction in a log ending at `end`.
fn last_tid_of(file: &File, end: u64) -> Result<Tid> {
    match BackwardIterator::new(file, end).next() {
        Some(txn) => Ok(txn?.tid()),
        None => Ok(Tid::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create(dir: &TempDir, config: StorageConfig) -> FileStorage {
        FileStorage::open(dir.path().join("data.fs"), config.create(true)).unwrap()
    }

    fn commit(storage: &FileStorage, stores: &[(u64, Tid, &[u8])]) -> Tid {
        let txn = Transaction::new("tester", "commit");
        storage.tpc_begin(&txn).unwrap();
        for (oid, expected, payload) in stores {
            storage
                .store(Oid(*oid), *expected, payload.to_vec(), &txn)
                .unwrap();
        }
        storage.tpc_vote(&txn).unwrap();
        storage.tpc_finish(&txn).unwrap()
    }

    #[test]
    fn test_wrong_state_transitions() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let txn = Transaction::new("u", "d");

        assert!(matches!(
            storage.store(Oid(1), Tid::ZERO, b"x".to_vec(), &txn),
            Err(StorageError::TpcState(_))
        ));
        assert!(matches!(storage.tpc_vote(&txn), Err(StorageError::TpcState(_))));

        storage.tpc_begin(&txn).unwrap();
        assert!(matches!(storage.tpc_begin(&txn), Err(StorageError::TpcState(_))));
        assert!(matches!(storage.tpc_finish(&txn), Err(StorageError::TpcState(_))));
        storage.store(Oid(1), Tid::ZERO, b"x".to_vec(), &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        assert!(matches!(storage.tpc_vote(&txn), Err(StorageError::TpcState(_))));
        assert!(matches!(
            storage.store(Oid(2), Tid::ZERO, b"y".to_vec(), &txn),
            Err(StorageError::TpcState(_))
        ));
        storage.tpc_finish(&txn).unwrap();
        assert!(matches!(storage.tpc_finish(&txn), Err(StorageError::TpcState(_))));

        // Aborting a transaction that is not in progress is harmless.
        storage.tpc_abort(&txn).unwrap();
        storage.tpc_abort(&Transaction::new("other", "")).unwrap();
    }

    #[test]
    fn test_abort_after_vote_restores_size() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        commit(&storage, &[(1, Tid::ZERO, b"kept")]);
        let before = storage.size();

        let txn = Transaction::new("u", "d");
        storage.tpc_begin(&txn).unwrap();
        storage.store(Oid(2), Tid::ZERO, b"dropped".to_vec(), &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        assert!(fs::metadata(storage.path()).unwrap().len() > before);
        storage.tpc_abort(&txn).unwrap();

        assert_eq!(storage.size(), before);
        assert_eq!(fs::metadata(storage.path()).unwrap().len(), before);
        assert!(matches!(
            storage.load(Oid(2)),
            Err(StorageError::KeyNotFound { oid: Oid(2), .. })
        ));
        assert!(!sibling(storage.path(), ".tmp").exists());
    }

    #[test]
    fn test_conflict_without_resolver() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let t1 = commit(&storage, &[(1, Tid::ZERO, b"a")]);

        let txn = Transaction::new("u", "d");
        storage.tpc_begin(&txn).unwrap();
        let err = storage
            .store(Oid(1), Tid::ZERO, b"b".to_vec(), &txn)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict { oid: Oid(1), expected: Tid::ZERO, current } if current == t1
        ));
        storage.store(Oid(1), t1, b"b".to_vec(), &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        storage.tpc_finish(&txn).unwrap();
        assert_eq!(storage.load(Oid(1)).unwrap().0, b"b");
    }

    #[test]
    fn test_empty_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let txn = Transaction::new("u", "d");
        storage.tpc_begin(&txn).unwrap();
        assert!(matches!(
            storage.store(Oid(1), Tid::ZERO, Vec::new(), &txn),
            Err(StorageError::EmptyPayload { oid: Oid(1) })
        ));
    }

    #[test]
    fn test_quota_aborts_at_vote() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default().quota(200));
        let before = storage.size();
        let txn = Transaction::new("u", "d");
        storage.tpc_begin(&txn).unwrap();
        storage.store(Oid(1), Tid::ZERO, vec![7u8; 500], &txn).unwrap();
        assert!(matches!(
            storage.tpc_vote(&txn),
            Err(StorageError::Quota { quota: 200, .. })
        ));
        storage.tpc_abort(&txn).unwrap();
        assert_eq!(storage.size(), before);
        assert_eq!(fs::metadata(storage.path()).unwrap().len(), before);

        // The slot was released, so a small transaction still fits.
        commit(&storage, &[(1, Tid::ZERO, b"small")]);
        assert_eq!(storage.load(Oid(1)).unwrap().0, b"small");
    }

    #[test]
    fn test_oversized_metadata_rejected_at_begin() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let txn = Transaction::new(vec![b'u'; 70_000], "d");
        assert!(matches!(storage.tpc_begin(&txn), Err(StorageError::Metadata(_))));
    }

    #[test]
    fn test_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        let t1 = {
            let storage = create(&dir, StorageConfig::default());
            let t1 = commit(&storage, &[(1, Tid::ZERO, b"a")]);
            storage.close().unwrap();
            t1
        };
        let writer = FileStorage::open(&path, StorageConfig::default()).unwrap();
        // Read-only opens take no lock.
        let reader = FileStorage::open(&path, StorageConfig::default().read_only(true)).unwrap();
        assert!(reader.is_read_only());
        assert_eq!(reader.load(Oid(1)).unwrap(), (b"a".to_vec(), t1));
        assert!(matches!(
            reader.tpc_begin(&Transaction::new("u", "d")),
            Err(StorageError::ReadOnly)
        ));
        assert!(matches!(
            reader.pack(Tid::MAX, |_| Vec::new()),
            Err(StorageError::ReadOnly)
        ));
        drop(writer);
        assert!(matches!(
            FileStorage::open(&path, StorageConfig::default().read_only(true).create(true)),
            Err(StorageError::ReadOnly)
        ));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        let first = create(&dir, StorageConfig::default());
        assert!(matches!(
            FileStorage::open(&path, StorageConfig::default()),
            Err(StorageError::Locked(_))
        ));
        first.close().unwrap();
        FileStorage::open(&path, StorageConfig::default()).unwrap();
    }

    #[test]
    fn test_expired_transaction_is_aborted() {
        let dir = TempDir::new().unwrap();
        let storage = create(
            &dir,
            StorageConfig::default().transaction_timeout(Some(Duration::from_millis(20))),
        );
        let before = storage.size();
        let stale = Transaction::new("u", "stale");
        storage.tpc_begin(&stale).unwrap();
        storage.store(Oid(1), Tid::ZERO, b"a".to_vec(), &stale).unwrap();
        storage.tpc_vote(&stale).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // The next committer takes over the slot; the voted data is cut off.
        let fresh = Transaction::new("u", "fresh");
        storage.tpc_begin(&fresh).unwrap();
        assert_eq!(fs::metadata(storage.path()).unwrap().len(), before);
        assert!(matches!(storage.tpc_finish(&stale), Err(StorageError::TpcState(_))));
        storage.tpc_abort(&fresh).unwrap();

        let late = Transaction::new("u", "late");
        storage.tpc_begin(&late).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            storage.store(Oid(2), Tid::ZERO, b"b".to_vec(), &late),
            Err(StorageError::TpcState(_))
        ));
        // The timed-out transaction no longer holds the slot.
        commit(&storage, &[(2, Tid::ZERO, b"b")]);
    }

    #[test]
    fn test_begin_refuses_when_tids_run_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        let (file, _, _) = crate::scanner::tests::write_log(
            &path,
            &[(
                u64::MAX,
                TxnStatus::Committed,
                vec![(1, RecordData::Payload(b"last".to_vec()))],
            )],
        );
        drop(file);
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        assert_eq!(storage.last_transaction(), Tid::MAX);

        let txn = Transaction::new("tester", "one too many");
        assert!(matches!(
            storage.tpc_begin(&txn),
            Err(StorageError::TpcState(_))
        ));
        assert!(matches!(
            storage.store(Oid(1), Tid::MAX, b"x".to_vec(), &txn),
            Err(StorageError::TpcState(_))
        ));
        assert_eq!(storage.load(Oid(1)).unwrap(), (b"last".to_vec(), Tid::MAX));
    }

    #[test]
    fn test_new_oid_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.fs");
        let storage = create(&dir, StorageConfig::default());
        assert_eq!(storage.new_oid(), Oid(1));
        assert_eq!(storage.new_oid(), Oid(2));
        commit(&storage, &[(10, Tid::ZERO, b"ten")]);
        assert_eq!(storage.new_oid(), Oid(11));
        storage.close().unwrap();

        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        assert_eq!(storage.new_oid(), Oid(11));
    }

    #[test]
    fn test_iterator_and_undo_log() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let t1 = commit(&storage, &[(1, Tid::ZERO, b"a")]);
        let t2 = commit(&storage, &[(2, Tid::ZERO, b"b")]);
        let t3 = commit(&storage, &[(1, t1, b"c"), (3, Tid::ZERO, b"d")]);

        let tids: Vec<_> = storage
            .iterator(None, None)
            .unwrap()
            .map(|t| t.unwrap().tid())
            .collect();
        assert_eq!(tids, vec![t1, t2, t3]);
        let last: Vec<_> = storage
            .iterator(Some(t2), None)
            .unwrap()
            .map(|t| t.unwrap())
            .collect();
        assert_eq!(last.len(), 2);
        let records: Vec<_> = last[1].records().map(|r| r.unwrap().oid()).collect();
        assert_eq!(records, vec![Oid(1), Oid(3)]);
        assert_eq!(last[1].user(), b"tester");

        let log = storage.undo_log(0, 10).unwrap();
        assert_eq!(log.iter().map(|u| u.tid).collect::<Vec<_>>(), vec![t3, t2, t1]);
        assert_eq!(log[0].description, b"commit");
        assert!(log[0].time.is_some());
        let page = storage.undo_log(1, 2).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].tid, t2);
    }

    #[test]
    fn test_undo_rejects_object_already_in_transaction() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let t1 = commit(&storage, &[(1, Tid::ZERO, b"a")]);
        let t2 = commit(&storage, &[(1, t1, b"b")]);
        let txn = Transaction::new("u", "d");
        storage.tpc_begin(&txn).unwrap();
        storage.store(Oid(1), t2, b"c".to_vec(), &txn).unwrap();
        assert!(matches!(
            storage.undo(t2, &txn),
            Err(StorageError::Undo { oid: Some(Oid(1)), .. })
        ));
        assert!(matches!(
            storage.undo(Tid(t2.0 + 1), &txn),
            Err(StorageError::Undo { oid: None, .. })
        ));
    }

    #[test]
    fn test_undo_of_creation_removes_object() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, StorageConfig::default());
        let t1 = commit(&storage, &[(1, Tid::ZERO, b"a")]);
        let txn = Transaction::new("u", "undo creation");
        storage.tpc_begin(&txn).unwrap();
        assert_eq!(storage.undo(t1, &txn).unwrap(), vec![Oid(1)]);
        storage.tpc_vote(&txn).unwrap();
        let t2 = storage.tpc_finish(&txn).unwrap();

        assert!(matches!(storage.load(Oid(1)), Err(StorageError::KeyNotFound { .. })));
        assert_eq!(storage.load_at(Oid(1), t2).unwrap(), None);
        assert_eq!(storage.load_at(Oid(1), t1).unwrap(), Some((b"a".to_vec(), t1)));
        let history = storage.history(Oid(1), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].size, 0);

        // Recreating the object expects the tid of the undo record.
        commit(&storage, &[(1, t2, b"again")]);
        assert_eq!(storage.load(Oid(1)).unwrap().0, b"again");
    }
}
