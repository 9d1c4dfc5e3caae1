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

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Open the log for reading only. No lock file is taken and recovery never truncates.
    pub read_only: bool,
    /// Start a fresh log, discarding any existing one at the same path.
    pub create: bool,
    /// Maximum size of the data file in bytes. Zero means unlimited.
    pub quota: u64,
    /// Whether pack traces references from the root object and discards unreachable objects,
    /// or merely discards history older than the pack time.
    pub pack_gc: bool,
    /// Keep the previous generation of the log as `<name>.old` after a pack.
    pub pack_keep_old: bool,
    /// Directory holding out-of-log blob payloads. Blob operations fail when unset.
    pub blob_dir: Option<PathBuf>,
    /// How long a transaction may stay between `tpc_begin` and `tpc_finish` before another
    /// committer is allowed to forcibly abort it. `None` waits forever.
    pub transaction_timeout: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            create: false,
            quota: 0,
            pack_gc: true,
            pack_keep_old: true,
            blob_dir: None,
            transaction_timeout: Some(DEFAULT_TRANSACTION_TIMEOUT),
        }
    }
}

impl StorageConfig {
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn quota(mut self, quota: u64) -> Self {
        self.quota = quota;
        self
    }

    pub fn pack_gc(mut self, pack_gc: bool) -> Self {
        self.pack_gc = pack_gc;
        self
    }

    pub fn pack_keep_old(mut self, keep: bool) -> Self {
        self.pack_keep_old = keep;
        self
    }

    pub fn blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = Some(dir.into());
        self
    }

    pub fn transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}
