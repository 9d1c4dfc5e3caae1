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

use crate::types::{Oid, Tid};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything a storage operation can fail with. Log errors carry the file offset, per-object
/// errors carry the oid.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Corrupted data file at offset {pos}: {reason}")]
    Corrupted { pos: u64, reason: String },
    #[error("Data file ends mid-transaction at offset {pos}")]
    Truncated { pos: u64 },
    #[error("No record for oid {oid}{}", .tid.map(|t| format!(" at tid {t}")).unwrap_or_default())]
    KeyNotFound { oid: Oid, tid: Option<Tid> },
    #[error("Conflict on oid {oid}: expected tid {expected}, current tid {current}")]
    Conflict { oid: Oid, expected: Tid, current: Tid },
    #[error("Cannot undo{}: {reason}", .oid.map(|o| format!(" oid {o}")).unwrap_or_default())]
    Undo { oid: Option<Oid>, reason: String },
    #[error("Storage is read-only")]
    ReadOnly,
    #[error("Transaction state error: {0}")]
    TpcState(String),
    #[error("Quota of {quota} bytes exceeded; commit would grow the file to {requested} bytes")]
    Quota { quota: u64, requested: u64 },
    #[error("Empty payload for oid {oid}; a zero-length record is reserved for backpointers")]
    EmptyPayload { oid: Oid },
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid transaction metadata: {0}")]
    Metadata(String),
    #[error("Data file {0:?} is locked by another process")]
    Locked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn corrupted(pos: u64, reason: impl Into<String>) -> Self {
        StorageError::Corrupted {
            pos,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(oid: Oid) -> Self {
        StorageError::KeyNotFound { oid, tid: None }
    }

    pub(crate) fn undo(oid: Option<Oid>, reason: impl Into<String>) -> Self {
        StorageError::Undo {
            oid,
            reason: reason.into(),
        }
    }

    /// True for the errors recovery may repair by truncating the log tail, as long as no
    /// complete transaction follows the damage.
    pub fn is_tail_damage(&self) -> bool {
        matches!(
            self,
            StorageError::Truncated { .. } | StorageError::Corrupted { .. }
        )
    }
}
