// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::input::file::file_id::{FileId, IdentityMode};
use crate::input::file::fingerprint::{Fingerprint, MAX_BLOCK_SIZE};
use std::fs::{File, Metadata};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// One log file as observed by a single scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileRecord {
    pub filename: PathBuf,
    /// Modification time in seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    /// Bytes consumed and dispatched.
    pub processed_size: u64,
    /// Order in which files were processed, 0 when not processed yet.
    pub seq: u32,
    /// The last record in the file has no terminator yet.
    pub incomplete: bool,
    /// Index of the file in the previous list this one is a copy of.
    pub copy_of: Option<usize>,
    pub id: FileId,
    /// `None` until the head and tail blocks have been hashed.
    pub fingerprint: Option<Fingerprint>,
    /// Set when an mtime change without a size change was seen, cleared once resolved.
    pub retry: bool,
}

impl LogFileRecord {
    pub fn new(filename: PathBuf, mtime: i64, size: u64, id: FileId) -> Self {
        Self {
            filename,
            mtime,
            size,
            processed_size: 0,
            seq: 0,
            incomplete: false,
            copy_of: None,
            id,
            fingerprint: None,
            retry: false,
        }
    }

    /// Open `path`, take its identity and hash its head and tail blocks.
    ///
    /// `size` is the size seen by the scan; the file must still hold that many bytes.
    pub fn observe(path: &Path, mtime: i64, size: u64, mode: IdentityMode) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::access(path, e))?;
        let id = FileId::from_file(&file, mode).map_err(|e| Error::identity(path, e))?;

        let mut record = Self::new(path.to_path_buf(), mtime, size, id);
        record.fingerprint =
            Some(Fingerprint::compute(&mut file, size).map_err(|e| Error::identity(path, e))?);
        Ok(record)
    }

    /// Block size of the fingerprint, if computed.
    pub fn block_size(&self) -> Option<u64> {
        self.fingerprint.as_ref().map(|fp| fp.block_size())
    }

    /// Whether every byte currently in the file has been consumed.
    pub fn is_fully_processed(&self) -> bool {
        self.size == self.processed_size
    }

    /// Recompute the fingerprint when the file outgrew a partial block.
    pub fn refresh_fingerprint(&mut self) -> Result<()> {
        let stale = match self.block_size() {
            Some(block) => block < MAX_BLOCK_SIZE && self.size > block,
            None => false,
        };
        if !stale {
            return Ok(());
        }

        let mut file = File::open(&self.filename).map_err(|e| Error::access(&self.filename, e))?;
        let fp = Fingerprint::compute(&mut file, self.size)
            .map_err(|e| Error::identity(&self.filename, e))?;
        debug!(path = ?self.filename, block_size = fp.block_size(), "Refreshed fingerprint");
        self.fingerprint = Some(fp);
        Ok(())
    }
}

/// Modification time of `metadata` in whole seconds since the epoch.
pub fn mtime_secs(metadata: &Metadata) -> i64 {
    match metadata.modified() {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

/// Files captured by one scan, ordered by ascending mtime and descending name on ties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: Vec<LogFileRecord>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the order. A file with a name already in the set is skipped.
    pub fn insert_sorted(&mut self, record: LogFileRecord) -> bool {
        if self.files.iter().any(|f| f.filename == record.filename) {
            warn!(path = ?record.filename, "File already added to the list, skipping");
            return false;
        }

        let pos = self
            .files
            .iter()
            .position(|f| {
                f.mtime > record.mtime
                    || (f.mtime == record.mtime
                        && f.filename.as_os_str() < record.filename.as_os_str())
            })
            .unwrap_or(self.files.len());

        self.files.insert(pos, record);
        true
    }

    /// Append without reordering, for lists rebuilt from a trusted source.
    pub fn push(&mut self, record: LogFileRecord) {
        self.files.push(record);
    }

    /// Index of the file processed last: the one with the largest sequence number,
    /// or the first file when nothing was processed yet.
    pub fn last_processed(&self) -> usize {
        let mut idx = 0;
        let mut max_seq = 0;

        for (i, f) in self.files.iter().enumerate() {
            if f.seq > max_seq {
                max_seq = f.seq;
                idx = i;
            }
        }
        idx
    }

    pub fn max_seq(&self) -> u32 {
        self.files.iter().map(|f| f.seq).max().unwrap_or(0)
    }

    pub fn into_vec(self) -> Vec<LogFileRecord> {
        self.files
    }
}

impl Deref for FileSet {
    type Target = [LogFileRecord];

    fn deref(&self) -> &Self::Target {
        &self.files
    }
}

impl DerefMut for FileSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.files
    }
}

impl From<Vec<LogFileRecord>> for FileSet {
    fn from(files: Vec<LogFileRecord>) -> Self {
        Self { files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, mtime: i64) -> LogFileRecord {
        LogFileRecord::new(PathBuf::from(name), mtime, 0, FileId::default())
    }

    fn names(set: &FileSet) -> Vec<String> {
        set.iter()
            .map(|f| f.filename.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_ordering_by_mtime_then_name_descending() {
        let mut set = FileSet::new();
        set.insert_sorted(rec("app.log", 300));
        set.insert_sorted(rec("app.log.1", 200));
        set.insert_sorted(rec("app.log.2", 200));
        set.insert_sorted(rec("app.log.3", 100));

        assert_eq!(
            names(&set),
            vec!["app.log.3", "app.log.2", "app.log.1", "app.log"]
        );
    }

    #[test]
    fn test_duplicate_name_is_skipped() {
        let mut set = FileSet::new();
        assert!(set.insert_sorted(rec("app.log", 1)));
        assert!(!set.insert_sorted(rec("app.log", 2)));
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].mtime, 1);
    }

    #[test]
    fn test_last_processed() {
        let mut set = FileSet::new();
        set.insert_sorted(rec("a", 1));
        set.insert_sorted(rec("b", 2));
        set.insert_sorted(rec("c", 3));
        assert_eq!(set.last_processed(), 0);

        set[0].seq = 1;
        set[1].seq = 2;
        assert_eq!(set.last_processed(), 1);
        assert_eq!(set.max_seq(), 2);
    }

    #[test]
    fn test_observe_hashes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        let record = LogFileRecord::observe(&path, 10, 8, IdentityMode::DevInode).unwrap();
        assert_eq!(record.block_size(), Some(8));
        assert_eq!(record.processed_size, 0);
        assert_eq!(record.copy_of, None);
    }

    #[test]
    fn test_refresh_fingerprint_after_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\n").unwrap();

        let mut record = LogFileRecord::observe(&path, 10, 4, IdentityMode::DevInode).unwrap();
        std::fs::write(&path, "one\ntwo\n").unwrap();
        record.size = 8;
        record.refresh_fingerprint().unwrap();

        assert_eq!(record.block_size(), Some(8));
    }
}
