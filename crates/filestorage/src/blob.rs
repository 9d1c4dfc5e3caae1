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

//! Out-of-log payload files. A committed blob lives at `<blob_dir>/<oid>/<tid>.blob`, keyed by
//! the revision whose record carries its payload. Uncommitted blobs wait in `<blob_dir>/tmp`.

use crate::error::{Result, StorageError};
use crate::types::{Oid, Tid};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = "tmp";
const BLOB_SUFFIX: &str = ".blob";

#[derive(Debug)]
pub(crate) struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join(STAGING_DIR))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn oid_dir(&self, oid: Oid) -> PathBuf {
        self.dir.join(format!("{:016x}", oid.0))
    }

    pub fn path_for(&self, oid: Oid, tid: Tid) -> PathBuf {
        self.oid_dir(oid).join(format!("{:016x}{BLOB_SUFFIX}", tid.0))
    }

    /// Takes ownership of `source`, moving it into the staging area.
    pub fn stage(&self, source: &Path) -> Result<PathBuf> {
        let staged = self
            .dir
            .join(STAGING_DIR)
            .join(format!("{}{BLOB_SUFFIX}", Uuid::new_v4()));
        move_file(source, &staged)?;
        Ok(staged)
    }

    pub fn publish(&self, staged: &Path, oid: Oid, tid: Tid) -> Result<PathBuf> {
        fs::create_dir_all(self.oid_dir(oid))?;
        let target = self.path_for(oid, tid);
        fs::rename(staged, &target)?;
        Ok(target)
    }

    pub fn discard(&self, staged: &Path) {
        if let Err(e) = fs::remove_file(staged) {
            warn!("Unable to remove staged blob {:?}: {}", staged, e);
        }
    }

    pub fn load(&self, oid: Oid, tid: Tid) -> Result<PathBuf> {
        let path = self.path_for(oid, tid);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StorageError::KeyNotFound {
                oid,
                tid: Some(tid),
            })
        }
    }

    /// Makes the blob of revision `from` also available as revision `to`.
    pub fn relink(&self, oid: Oid, from: Tid, to: Tid) -> Result<()> {
        let source = self.path_for(oid, from);
        if !source.is_file() {
            return Ok(());
        }
        let target = self.path_for(oid, to);
        if fs::hard_link(&source, &target).is_err() {
            fs::copy(&source, &target)?;
        }
        Ok(())
    }

    /// Removes committed blobs whose revision is not in `keep`, plus anything left in staging.
    /// Returns the number of files removed.
    pub fn prune(&self, keep: &HashSet<(Oid, Tid)>) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == STAGING_DIR {
                for staged in fs::read_dir(entry.path())? {
                    fs::remove_file(staged?.path())?;
                    removed += 1;
                }
                continue;
            }
            let Ok(oid) = u64::from_str_radix(name, 16).map(Oid) else {
                continue;
            };
            for blob in fs::read_dir(entry.path())? {
                let blob = blob?;
                let tid = blob
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(BLOB_SUFFIX))
                    .and_then(|n| u64::from_str_radix(n, 16).ok())
                    .map(Tid);
                if let Some(tid) = tid
                    && !keep.contains(&(oid, tid))
                {
                    fs::remove_file(blob.path())?;
                    removed += 1;
                }
            }
            if fs::read_dir(entry.path())?.next().is_none() {
                fs::remove_dir(entry.path())?;
            }
        }
        debug!("Pruned {removed} blob files from {:?}", self.dir);
        Ok(removed)
    }
}

fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        // Different filesystem.
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(source, target)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_publish_load() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(&dir.path().join("blobs")).unwrap();
        let source = dir.path().join("upload");
        fs::write(&source, b"big payload").unwrap();

        let staged = blobs.stage(&source).unwrap();
        assert!(!source.exists());
        assert!(blobs.load(Oid(3), Tid(9)).is_err());

        let published = blobs.publish(&staged, Oid(3), Tid(9)).unwrap();
        assert_eq!(blobs.load(Oid(3), Tid(9)).unwrap(), published);
        assert_eq!(fs::read(published).unwrap(), b"big payload");
    }

    #[test]
    fn test_discard_and_prune() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        for (oid, tid) in [(1, 10), (1, 20), (2, 10)] {
            let source = dir.path().join(format!("src-{oid}-{tid}"));
            fs::write(&source, b"x").unwrap();
            let staged = blobs.stage(&source).unwrap();
            blobs.publish(&staged, Oid(oid), Tid(tid)).unwrap();
        }
        let source = dir.path().join("abandoned");
        fs::write(&source, b"x").unwrap();
        let staged = blobs.stage(&source).unwrap();
        blobs.discard(&staged);
        assert!(!staged.exists());

        blobs.relink(Oid(2), Tid(10), Tid(30)).unwrap();
        let keep = HashSet::from([(Oid(1), Tid(20)), (Oid(2), Tid(30))]);
        assert_eq!(blobs.prune(&keep).unwrap(), 2);
        assert!(blobs.load(Oid(1), Tid(10)).is_err());
        assert!(blobs.load(Oid(1), Tid(20)).is_ok());
        assert!(blobs.load(Oid(2), Tid(10)).is_err());
        assert_eq!(fs::read(blobs.load(Oid(2), Tid(30)).unwrap()).unwrap(), b"x");
    }
}
