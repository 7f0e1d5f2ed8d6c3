// SPDX-License-Identifier: Apache-2.0

//! Per-target state kept between polls.

use std::time::Instant;
use tracing::warn;

use crate::error::Result;
use crate::input::file::{Cursor, FileSet, IdentityMode, LogFileRecord};
use crate::persistence::PersistedRecord;

/// Everything a target remembers from one poll to the next.
#[derive(Debug, Clone)]
pub struct TailState {
    /// Files seen by the last successful scan.
    pub files: FileSet,
    pub cursor: Cursor,
    /// Start reading at the end of the newest file on the first poll.
    pub skip_old_data: bool,
    pub identity_mode: IdentityMode,
    /// Consecutive failed polls.
    pub error_count: u32,
    /// When the last poll that may be followed by a jump started.
    pub start_time: Option<Instant>,
    /// Bytes consumed by the last poll, used to estimate the delay.
    pub processed_bytes: u64,
    /// No poll has completed yet.
    pub is_new: bool,
}

impl Default for TailState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TailState {
    pub fn new(skip_old_data: bool) -> Self {
        Self {
            files: FileSet::new(),
            cursor: Cursor::default(),
            skip_old_data,
            identity_mode: IdentityMode::default(),
            error_count: 0,
            start_time: None,
            processed_bytes: 0,
            is_new: true,
        }
    }

    /// Resume from an offset known to someone else, e.g. the collector.
    pub fn with_offset(mut self, lastlogsize: u64, mtime: i64) -> Self {
        self.cursor.lastlogsize = lastlogsize;
        self.cursor.mtime = mtime;
        self
    }

    /// The file read last, or the first file if none was read.
    pub fn last_processed_file(&self) -> Option<&LogFileRecord> {
        if self.files.is_empty() {
            return None;
        }
        Some(&self.files[self.files.last_processed()])
    }

    /// Snapshot for the persistence store.
    pub fn snapshot(&self) -> PersistedRecord {
        match self.last_processed_file() {
            Some(record) => PersistedRecord::from_record(record),
            None => PersistedRecord::offsets(self.cursor.lastlogsize, self.cursor.mtime),
        }
    }

    /// Take over a persisted snapshot.
    ///
    /// The stored offset replaces a different in-memory offset. The stored mtime is
    /// only taken when it is newer, a newer mtime in memory means reading has already
    /// moved past the snapshot. Returns whether anything was overridden.
    pub fn restore(&mut self, key: &str, snapshot: &PersistedRecord) -> Result<bool> {
        if let Some(record) = snapshot.to_record()? {
            self.files = FileSet::from(vec![record]);
        }

        let mut overridden = false;

        if self.cursor.lastlogsize != snapshot.processed_size {
            warn!(
                key,
                from = self.cursor.lastlogsize,
                to = snapshot.processed_size,
                "Overriding lastlogsize from persistent file"
            );
            self.cursor.lastlogsize = snapshot.processed_size;
            overridden = true;
        }

        if self.cursor.mtime < snapshot.mtime {
            warn!(
                key,
                from = self.cursor.mtime,
                to = snapshot.mtime,
                "Overriding mtime from persistent file"
            );
            self.cursor.mtime = snapshot.mtime;
            overridden = true;
        }

        Ok(overridden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::file::FileId;

    fn record(name: &str, seq: u32, processed: u64) -> LogFileRecord {
        let mut r = LogFileRecord::new(name.into(), 10, 100, FileId::new(1, 2, 0));
        r.seq = seq;
        r.processed_size = processed;
        r
    }

    #[test]
    fn test_snapshot_without_files_has_offsets_only() {
        let state = TailState::new(false).with_offset(50, 7);
        assert_eq!(state.snapshot(), PersistedRecord::offsets(50, 7));
    }

    #[test]
    fn test_snapshot_uses_last_processed_file() {
        let mut state = TailState::default();
        state.files = FileSet::from(vec![record("/a", 2, 100), record("/b", 3, 40), record("/c", 0, 0)]);

        let snap = state.snapshot();
        assert_eq!(snap.filename.as_deref(), Some("/b"));
        assert_eq!(snap.processed_size, 40);
    }

    #[test]
    fn test_restore_priority() {
        let snapshot = PersistedRecord::from_record(&record("/a", 1, 60));

        // Offset differs, snapshot wins; snapshot mtime is older, memory wins
        let mut state = TailState::new(false).with_offset(10, 20);
        assert!(state.restore("log[/a]", &snapshot).unwrap());
        assert_eq!(state.cursor.lastlogsize, 60);
        assert_eq!(state.cursor.mtime, 20);
        assert_eq!(state.files.len(), 1);

        // Newer snapshot mtime is taken
        let mut state = TailState::new(false).with_offset(60, 5);
        assert!(state.restore("log[/a]", &snapshot).unwrap());
        assert_eq!(state.cursor.mtime, 10);

        // Nothing to override
        let mut state = TailState::new(false).with_offset(60, 10);
        assert!(!state.restore("log[/a]", &snapshot).unwrap());
    }
}
