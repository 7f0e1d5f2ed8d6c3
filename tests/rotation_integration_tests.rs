// SPDX-License-Identifier: Apache-2.0

//! Whole polls over temporary directories: rotation, restarts, backpressure and
//! skipping ahead.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use logtail::check::{CheckOutcome, Target};
use logtail::config::{LogSource, RotationMode, TargetConfig};
use logtail::error::Error;
use logtail::input::file::{DirectoryFinder, LogFileRecord};
use logtail::persistence::{JsonFilePersister, PersistedRecord, Persister};
use logtail::sink::{LogValue, Sink};
use tempfile::TempDir;
use tower::BoxError;

/// Keeps the text of every accepted value, optionally refusing values after a
/// number of accepted ones.
#[derive(Default)]
struct RecordingSink {
    values: Vec<String>,
    accept: Option<usize>,
}

impl RecordingSink {
    fn new() -> Self {
        Self::default()
    }

    fn reject_after(mut self, n: usize) -> Self {
        self.accept = Some(n);
        self
    }

    fn accept_all(&mut self) {
        self.accept = None;
    }

    fn lines(&self) -> Vec<&str> {
        self.values.iter().map(String::as_str).collect()
    }
}

impl Sink for RecordingSink {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError> {
        if let Some(remaining) = self.accept.as_mut() {
            if *remaining == 0 {
                return Err("sink is full".into());
            }
            *remaining -= 1;
        }
        self.values.push(value.value.to_string());
        Ok(())
    }
}

fn append(path: &Path, text: &str) {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

/// Set the modification time of `path` to `secs` seconds ago without touching
/// its content.
fn set_mtime_ago(path: &Path, secs: u64) {
    let f = fs::File::options().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

fn numbered(n: usize) -> String {
    (0..n).map(|i| format!("line {i:04}\n")).collect()
}

fn logrt(dir: &TempDir, pattern: &str) -> TargetConfig {
    let mut config = TargetConfig::new(
        "logrt[test]",
        LogSource::LogRt {
            path: format!("{}/{pattern}", dir.path().display()),
        },
    );
    config.max_lines = Some(1000);
    config
}

fn record<'a>(target: &'a Target, name: &str) -> &'a LogFileRecord {
    target
        .state
        .files
        .iter()
        .find(|f| f.filename.file_name().unwrap() == name)
        .unwrap_or_else(|| panic!("{name} not in file list"))
}

fn assert_processed_within_size(target: &Target) {
    for f in target.state.files.iter() {
        assert!(
            f.processed_size <= f.size,
            "{:?}: processed {} > size {}",
            f.filename,
            f.processed_size,
            f.size
        );
    }
}

#[test]
fn test_rename_rotation() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("a.log");
    append(&live, &numbered(10));

    let mut target = Target::new("collector", logrt(&dir, "a\\.log.*")).unwrap();
    let mut sink = RecordingSink::new();

    target.check(&mut sink);
    assert_eq!(sink.values.len(), 10);
    assert_eq!(record(&target, "a.log").processed_size, 100);

    fs::rename(&live, dir.path().join("a.log.1")).unwrap();
    fs::File::create(&live).unwrap();

    target.check(&mut sink);
    assert_eq!(sink.values.len(), 10, "rotated file must not be read again");
    assert_eq!(record(&target, "a.log.1").processed_size, 100);
    assert_eq!(record(&target, "a.log").processed_size, 0);
    assert_processed_within_size(&target);

    append(&live, "fresh\n");
    target.check(&mut sink);
    assert_eq!(sink.lines().last(), Some(&"fresh"));
    assert_eq!(sink.values.len(), 11);
}

#[test]
fn test_lines_written_before_rename_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("a.log");
    append(&live, "one\n");

    let mut target = Target::new("collector", logrt(&dir, "a\\.log.*")).unwrap();
    let mut sink = RecordingSink::new();
    target.check(&mut sink);

    append(&live, "two\n");
    fs::rename(&live, dir.path().join("a.log.1")).unwrap();
    append(&live, "three\n");

    target.check(&mut sink);
    assert_eq!(sink.lines(), vec!["one", "two", "three"]);
    assert_processed_within_size(&target);
}

#[test]
fn test_copytruncate_rotation() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("x.log");
    append(&live, &numbered(50));

    let mut config = logrt(&dir, "x\\.log.*");
    config.rotation = Some(RotationMode::CopyTruncate);
    let mut target = Target::new("collector", config).unwrap();
    let mut sink = RecordingSink::new();

    target.check(&mut sink);
    assert_eq!(sink.values.len(), 50);

    fs::copy(&live, dir.path().join("x.log.bak")).unwrap();
    fs::write(&live, "fresh one\n").unwrap();

    target.check(&mut sink);
    assert_eq!(sink.values.len(), 51, "the copy must not be read again");
    assert_eq!(sink.lines().last(), Some(&"fresh one"));
    assert_eq!(record(&target, "x.log.bak").processed_size, 500);
    assert_eq!(record(&target, "x.log").processed_size, 10);
    assert_processed_within_size(&target);
}

#[test]
fn test_unchanged_files_dispatch_nothing() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join("a.log.1"), "old\n");
    append(&dir.path().join("a.log"), "new\n");

    let mut target = Target::new("collector", logrt(&dir, "a\\.log.*")).unwrap();
    let mut sink = RecordingSink::new();

    target.check(&mut sink);
    let after_first = sink.values.len();
    assert_eq!(after_first, 2);

    target.check(&mut sink);
    target.check(&mut sink);
    assert_eq!(sink.values.len(), after_first);
}

#[test]
fn test_restart_resumes_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let live = dir.path().join("app.log");
    append(&live, "one\ntwo\n");

    let mut config = logrt(&dir, "app\\.log.*");
    config.persistent_dir = Some(state_dir.path().to_path_buf());

    let mut sink = RecordingSink::new();
    {
        let mut target = Target::new("collector", config.clone()).unwrap();
        target.check(&mut sink);
    }
    assert_eq!(sink.lines(), vec!["one", "two"]);

    // Rotated while nothing was running
    append(&live, "three\n");
    fs::rename(&live, dir.path().join("app.log.1")).unwrap();
    append(&live, "four\n");

    let mut target = Target::new("collector", config).unwrap();
    target.check(&mut sink);
    assert_eq!(sink.lines(), vec!["one", "two", "three", "four"]);
}

#[test]
fn test_rejecting_sink_keeps_offset() {
    let dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    append(&dir.path().join("app.log"), &numbered(5));

    let open = || JsonFilePersister::open(state_dir.path(), "collector", "logrt[test]").unwrap();
    let stored = open();
    let mut target = Target::with_parts(
        "collector",
        logrt(&dir, "app\\.log"),
        Box::new(DirectoryFinder::new(dir.path(), "app\\.log").unwrap()),
        Some(Box::new(open())),
    )
    .unwrap();
    let mut sink = RecordingSink::new().reject_after(0);

    for _ in 0..3 {
        assert!(matches!(target.check(&mut sink), CheckOutcome::Done { .. }));
        assert_eq!(target.state.cursor.lastlogsize, 0);
    }
    assert!(sink.values.is_empty());
    if let Some(snapshot) = stored.read().unwrap() {
        assert_eq!(snapshot.processed_size, 0);
    }

    sink.accept_all();
    target.check(&mut sink);
    assert_eq!(sink.values.len(), 5);
    assert_eq!(stored.read().unwrap().unwrap().processed_size, 50);
}

#[test]
fn test_touched_file_is_deferred_then_read_again() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("a.log");
    append(&live, "one\ntwo\n");
    set_mtime_ago(&live, 100);

    let mut target = Target::new("collector", logrt(&dir, "a\\.log")).unwrap();
    let mut sink = RecordingSink::new();
    target.check(&mut sink);
    assert_eq!(sink.lines(), vec!["one", "two"]);

    // Same size and content, newer mtime
    set_mtime_ago(&live, 50);

    let outcome = target.check(&mut sink);
    assert!(
        matches!(outcome, CheckOutcome::Suppressed(Error::Deferred(_))),
        "{outcome:?}"
    );
    assert_eq!(sink.values.len(), 2);
    assert_eq!(target.state.error_count, 1);
    assert!(record(&target, "a.log").retry);
    assert_eq!(record(&target, "a.log").processed_size, 8);

    // Still unchanged on the next poll, so it is taken for a rewritten file
    assert!(matches!(target.check(&mut sink), CheckOutcome::Done { .. }));
    assert_eq!(sink.lines(), vec!["one", "two", "one", "two"]);
    assert_eq!(target.state.error_count, 0);
    assert!(!record(&target, "a.log").retry);
    assert_eq!(record(&target, "a.log").processed_size, 8);

    target.check(&mut sink);
    assert_eq!(sink.values.len(), 4);
}

#[test]
fn test_touched_file_is_not_read_again_without_reread() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("a.log");
    append(&live, "one\ntwo\n");
    set_mtime_ago(&live, 100);

    let mut config = logrt(&dir, "a\\.log");
    config.rotation = Some(RotationMode::MtimeNoReread);
    let mut target = Target::new("collector", config).unwrap();
    let mut sink = RecordingSink::new();
    target.check(&mut sink);
    assert_eq!(sink.values.len(), 2);

    set_mtime_ago(&live, 50);

    // Matching content settles it without waiting for another poll
    for _ in 0..2 {
        assert!(matches!(target.check(&mut sink), CheckOutcome::Done { .. }));
        assert_eq!(sink.values.len(), 2);
        assert_eq!(target.state.error_count, 0);
        assert!(!record(&target, "a.log").retry);
        assert_eq!(record(&target, "a.log").processed_size, 8);
    }

    append(&live, "three\n");
    target.check(&mut sink);
    assert_eq!(sink.lines(), vec!["one", "two", "three"]);
}

#[test]
fn test_jump_ahead_lands_on_line_start() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join("app.log"), &numbered(1000));

    let mut config = logrt(&dir, "app\\.log");
    config.max_delay = 1.0;
    let mut target = Target::new("collector", config).unwrap();

    // 100 bytes in 10 seconds, the 10000 byte backlog would take far too long
    target.state.start_time = Some(Instant::now() - Duration::from_secs(10));
    target.state.processed_bytes = 100;

    let mut sink = RecordingSink::new();
    let outcome = target.check(&mut sink);
    assert!(matches!(outcome, CheckOutcome::Done { jumped: true }));

    let offset = target.state.cursor.lastlogsize;
    assert!(offset <= 10000);
    assert_eq!(offset % 10, 0, "offset {offset} is not a line start");
    assert!(sink.values.len() < 10);
    for line in sink.lines() {
        assert!(line.starts_with("line "), "partial line {line:?}");
        assert_eq!(line.len(), 9);
    }
}

#[test]
fn test_snapshot_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    append(&dir.path().join("app.log"), "a\n");

    let mut config = logrt(&dir, "app\\.log");
    config.persistent_dir = Some(state_dir.path().to_path_buf());
    let mut target = Target::new("collector", config).unwrap();
    target.check(&mut RecordingSink::new());

    let path = target.persistent_path().unwrap();
    let text = fs::read_to_string(&path).unwrap();
    let parsed: PersistedRecord = serde_json::from_str(&text).unwrap();
    let again = serde_json::to_value(&parsed).unwrap();
    assert_eq!(again, serde_json::from_str::<serde_json::Value>(&text).unwrap());

    let mut persister = logtail::persistence::JsonFilePersister::open(
        state_dir.path(),
        "collector",
        "logrt[test]",
    )
    .unwrap();
    assert_eq!(persister.read().unwrap(), Some(parsed));
    target.forget().unwrap();
    assert!(persister.read().unwrap().is_none());
    persister.remove().unwrap();
}
