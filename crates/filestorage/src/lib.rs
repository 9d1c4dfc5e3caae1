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

//! An append-only transactional object store. Every committed revision of every object is
//! appended to a single log file. An in-memory index maps each object to its current record,
//! and older revisions stay reachable through per-object back links until a pack discards
//! them.

mod blob;
mod config;
mod error;
pub mod format;
pub mod index;
mod lock;
pub mod pack;
pub mod recovery;
pub mod scanner;
mod storage;
mod tpc;
mod types;

pub use config::{DEFAULT_TRANSACTION_TIMEOUT, StorageConfig};
pub use error::{Result, StorageError};
pub use index::FsIndex;
pub use pack::{BlobRelink, FileStoragePacker, PackOutcome, PackSource, PackStats, Packer};
pub use recovery::{RecoveryOutcome, RecoveryReport, Truncation, VerifyReport};
pub use scanner::{HistoryEntry, LogIterator, LogTransaction};
pub use storage::{ConflictResolver, FileStorage, Revision, UndoInfo};
pub use tpc::Transaction;
pub use types::{Oid, Tid};
