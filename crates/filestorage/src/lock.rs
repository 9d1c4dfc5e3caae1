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

use crate::error::{Result, StorageError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Exclusive advisory lock on `<data file>.lock`, held for as long as a storage is open for
/// writing. The lock file holds the owning process id; the lock itself goes away with the
/// file handle.
pub struct LockFile {
    _file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            error!(
                "Failed to lock {:?}; another process may have the storage open: {}",
                path, e
            );
            return Err(StorageError::Locked(path.to_path_buf()));
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Acquired storage lock {:?}", path);
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
