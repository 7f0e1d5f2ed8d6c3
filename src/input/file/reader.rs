// SPDX-License-Identifier: Apache-2.0

//! Incremental line reading from the durable offset.
//!
//! A record longer than the read buffer is matched once on its first buffer and its
//! remaining fragments are skipped until the terminator shows up. The offset only
//! moves past lines that were consumed and, if they matched, accepted by the sink.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, warn};

use crate::config::ItemMode;
use crate::error::{Error, Result};
use crate::input::file::encoding::TextEncoding;
use crate::input::file::pattern::LineMatcher;
use crate::input::file::record::LogFileRecord;
use crate::sink::{LogValue, Sink, ValueFlags};

/// Size of the read buffer. The widest encodings use 4 bytes per character, so this
/// holds 64k characters.
pub const READ_BUF_SIZE: usize = 256 * 1024;

/// Number of characters of a large record shown in the warning about it.
const LARGE_RECORD_PREVIEW: usize = 64;

/// Where reading stands for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Durable offset in the current file.
    pub lastlogsize: u64,
    /// Modification time reported with values.
    pub mtime: i64,
    /// Inside a record longer than the read buffer.
    pub big_rec: bool,
}

/// Per-poll limits on inspected and dispatched lines.
///
/// Either reaching zero stops the poll without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBudget {
    pub inspected: i64,
    pub dispatched: i64,
}

impl LineBudget {
    pub fn new(inspected: i64, dispatched: i64) -> Self {
        Self {
            inspected,
            dispatched,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.inspected <= 0 || self.dispatched <= 0
    }
}

/// Everything about a target the reader needs besides its position.
pub struct ReadContext<'a> {
    pub destination: &'a str,
    pub key: &'a str,
    pub matcher: &'a LineMatcher,
    pub encoding: &'a TextEncoding,
    pub mode: ItemMode,
}

enum Dispatch {
    /// Consumed: sent, counted or not matching.
    Done,
    /// The sink refused the line.
    Rejected,
}

impl ReadContext<'_> {
    fn dispatch(
        &self,
        line: &str,
        processed: u64,
        cursor: &Cursor,
        budget: &mut LineBudget,
        sink: &mut dyn Sink,
    ) -> Dispatch {
        match self.mode {
            ItemMode::Count => {
                if self.matcher.is_match(line) {
                    budget.dispatched -= 1;
                }
            }
            ItemMode::Lines => {
                let Some(value) = self.matcher.apply(line) else {
                    return Dispatch::Done;
                };

                let mut v = LogValue::line(self.destination, self.key, &value, processed);
                v.mtime = Some(cursor.mtime);
                v.flags = ValueFlags {
                    persistent: true,
                    count: false,
                };

                if let Err(e) = sink.send(&v) {
                    debug!(key = %self.key, offset = processed, error = %e, "Sink rejected line, will retry");
                    return Dispatch::Rejected;
                }
                budget.dispatched -= 1;
            }
        }
        Dispatch::Done
    }
}

/// Read `record` from `seek_offset`, dispatching matching lines.
///
/// Returns the number of bytes consumed.
pub fn process_log(
    record: &mut LogFileRecord,
    cursor: &mut Cursor,
    skip_old_data: &mut bool,
    seek_offset: u64,
    budget: &mut LineBudget,
    ctx: &ReadContext<'_>,
    sink: &mut dyn Sink,
) -> Result<u64> {
    debug!(
        path = ?record.filename,
        lastlogsize = cursor.lastlogsize,
        mtime = cursor.mtime,
        seek_offset,
        "Processing log file"
    );

    let mut file = File::open(&record.filename).map_err(|e| Error::access(&record.filename, e))?;
    file.seek(SeekFrom::Start(seek_offset))
        .map_err(|e| Error::access(&record.filename, e))?;

    cursor.lastlogsize = seek_offset;
    *skip_old_data = false;

    read_records(&mut file, record, cursor, budget, ctx, sink)?;

    let processed = cursor.lastlogsize.saturating_sub(seek_offset);
    debug!(path = ?record.filename, lastlogsize = cursor.lastlogsize, processed, "Processed log file");
    Ok(processed)
}

/// Read until end of file, a budget is spent or the sink refuses a line.
pub fn read_records(
    file: &mut File,
    record: &mut LogFileRecord,
    cursor: &mut Cursor,
    budget: &mut LineBudget,
    ctx: &ReadContext<'_>,
    sink: &mut dyn Sink,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        if budget.exhausted() {
            return Ok(());
        }

        let offset = match file.stream_position() {
            Ok(o) => o,
            Err(e) => {
                cursor.big_rec = false;
                return Err(Error::access(&record.filename, e));
            }
        };

        let nbytes = match fill(file, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                cursor.big_rec = false;
                return Err(Error::access(&record.filename, e));
            }
        };

        if nbytes == 0 {
            return Ok(());
        }

        let data = &mut buf[..nbytes];

        let Some((mut line_end, mut next)) = ctx.encoding.find_newline(data, 0) else {
            record.incomplete = true;

            if nbytes < READ_BUF_SIZE {
                // No terminator yet, wait for more data
                cursor.lastlogsize = offset;
                return Ok(());
            }

            if cursor.big_rec {
                // Middle of a long record, already matched
                cursor.lastlogsize = offset + nbytes as u64;
                continue;
            }

            let value = ctx.encoding.decode(data);
            let preview: String = value.chars().take(LARGE_RECORD_PREVIEW).collect();
            warn!(
                path = ?record.filename,
                offset,
                preview = %preview,
                "Log file contains a large record, only the first {} kB will be analyzed",
                READ_BUF_SIZE / 1024
            );

            let processed = offset + nbytes as u64;
            if let Dispatch::Rejected = ctx.dispatch(&value, processed, cursor, budget, sink) {
                return Ok(());
            }

            budget.inspected -= 1;
            cursor.lastlogsize = processed;
            cursor.big_rec = true;
            continue;
        };

        record.incomplete = false;
        let mut start = 0;

        loop {
            if budget.exhausted() {
                return Ok(());
            }

            if cursor.big_rec {
                // Trailing part of a long record
                cursor.lastlogsize = offset + next as u64;
                cursor.big_rec = false;
            } else {
                let value = ctx.encoding.decode(&data[start..line_end]);
                let processed = offset + next as u64;

                if let Dispatch::Rejected = ctx.dispatch(&value, processed, cursor, budget, sink) {
                    return Ok(());
                }

                budget.inspected -= 1;
                cursor.lastlogsize = processed;
            }

            start = next;
            match ctx.encoding.find_newline(data, start) {
                Some((e, n)) => {
                    line_end = e;
                    next = n;
                    record.incomplete = false;
                }
                None => {
                    if start < nbytes {
                        record.incomplete = true;
                    }
                    file.seek(SeekFrom::Start(cursor.lastlogsize))
                        .map_err(|e| Error::access(&record.filename, e))?;
                    break;
                }
            }
        }
    }
}

/// Read until `buf` is full or end of file.
fn fill(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::file::file_id::FileId;
    use crate::sink::RecordingSink;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        matcher: LineMatcher,
        encoding: TextEncoding,
        mode: ItemMode,
    }

    impl Fixture {
        fn new(pattern: &str) -> Self {
            Self {
                matcher: LineMatcher::new(pattern, None).unwrap(),
                encoding: TextEncoding::default(),
                mode: ItemMode::Lines,
            }
        }

        fn ctx(&self) -> ReadContext<'_> {
            ReadContext {
                destination: "collector:10051",
                key: "app",
                matcher: &self.matcher,
                encoding: &self.encoding,
                mode: self.mode,
            }
        }
    }

    fn record_for(path: &Path) -> LogFileRecord {
        let size = std::fs::metadata(path).unwrap().len();
        LogFileRecord::new(path.to_path_buf(), 0, size, FileId::default())
    }

    fn run(
        fx: &Fixture,
        record: &mut LogFileRecord,
        cursor: &mut Cursor,
        seek: u64,
        budget: &mut LineBudget,
        sink: &mut RecordingSink,
    ) -> u64 {
        let mut skip = false;
        process_log(record, cursor, &mut skip, seek, budget, &fx.ctx(), sink).unwrap()
    }

    #[test]
    fn test_reads_complete_lines_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\r\nthree").unwrap();

        let fx = Fixture::new("");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();

        let processed = run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);

        assert_eq!(sink.lines(), vec!["one", "two"]);
        assert_eq!(cursor.lastlogsize, 9);
        assert_eq!(processed, 9);
        assert!(record.incomplete);
        assert_eq!(sink.values[1].lastlogsize, 9);

        // Completing the last line makes it visible
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\n").unwrap();
        run(&fx, &mut record, &mut cursor, 9, &mut budget, &mut sink);

        assert_eq!(sink.lines(), vec!["one", "two", "three"]);
        assert_eq!(cursor.lastlogsize, 15);
        assert!(!record.incomplete);
    }

    #[test]
    fn test_non_matching_lines_advance_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "info a\nerror b\ninfo c\n").unwrap();

        let fx = Fixture::new("error");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();

        run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);

        assert_eq!(sink.lines(), vec!["error b"]);
        assert_eq!(cursor.lastlogsize, 22);
        assert_eq!(budget.inspected, 97);
        assert_eq!(budget.dispatched, 99);
    }

    #[test]
    fn test_rejected_line_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a\nb\nc\n").unwrap();

        let fx = Fixture::new("");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new().reject_after(1);

        run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);
        assert_eq!(sink.lines(), vec!["a"]);
        assert_eq!(cursor.lastlogsize, 2);

        sink.accept_all();
        let seek = cursor.lastlogsize;
        run(&fx, &mut record, &mut cursor, seek, &mut budget, &mut sink);
        assert_eq!(sink.lines(), vec!["a", "b", "c"]);
        assert_eq!(cursor.lastlogsize, 6);
    }

    #[test]
    fn test_budget_stops_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();

        let fx = Fixture::new("");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 2);
        let mut sink = RecordingSink::new();

        run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);

        assert_eq!(sink.lines(), vec!["1", "2"]);
        assert_eq!(cursor.lastlogsize, 4);
        assert!(budget.exhausted());
    }

    #[test]
    fn test_count_mode_counts_without_sending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "error 1\nok\nerror 2\n").unwrap();

        let mut fx = Fixture::new("error");
        fx.mode = ItemMode::Count;
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();

        run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);

        assert!(sink.values.is_empty());
        assert_eq!(budget.dispatched, 98);
        assert_eq!(cursor.lastlogsize, 19);
    }

    #[test]
    fn test_large_record_matched_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");

        let mut content = vec![b'x'; READ_BUF_SIZE + 100];
        content.push(b'\n');
        content.extend_from_slice(b"after\n");
        std::fs::write(&path, &content).unwrap();

        let fx = Fixture::new("");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();

        run(&fx, &mut record, &mut cursor, 0, &mut budget, &mut sink);

        assert_eq!(sink.values.len(), 2);
        assert_eq!(sink.values[0].value.len(), READ_BUF_SIZE);
        assert_eq!(sink.values[1].value, "after");
        assert_eq!(cursor.lastlogsize, content.len() as u64);
        assert!(!cursor.big_rec);
    }

    #[test]
    fn test_seek_offset_resumes_mid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old\nnew\n").unwrap();

        let fx = Fixture::new("");
        let mut record = record_for(&path);
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();

        let processed = run(&fx, &mut record, &mut cursor, 4, &mut budget, &mut sink);
        assert_eq!(sink.lines(), vec!["new"]);
        assert_eq!(processed, 4);
    }

    #[test]
    fn test_missing_file_is_access_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.log");

        let fx = Fixture::new("");
        let mut record = LogFileRecord::new(path, 0, 10, FileId::default());
        let mut cursor = Cursor::default();
        let mut budget = LineBudget::new(100, 100);
        let mut sink = RecordingSink::new();
        let mut skip = false;

        let err = process_log(
            &mut record,
            &mut cursor,
            &mut skip,
            0,
            &mut budget,
            &fx.ctx(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Access { .. }));
    }
}
