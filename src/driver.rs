// SPDX-License-Identifier: Apache-2.0

//! One poll of a target: scan, carry progress over from the previous scan, optionally
//! jump ahead, then read files in order until they are consumed or a budget runs out.

use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{ItemMode, RotationMode};
use crate::error::{Error, Result};
use crate::input::file::{
    FileFinder, FileSet, LineBudget, LogFileRecord, ReadContext, Scan, process_log,
};
use crate::persistence::{PersistedRecord, Persister};
use crate::rotation::copies::{
    delay_update_if_copies, ensure_order_if_mtimes_equal, handle_multiple_copies,
    max_processed_size_in_copies,
};
use crate::rotation::{calculate_delay, jump_ahead, remaining_bytes, update_new_list_from_old};
use crate::sink::Sink;
use crate::state::TailState;

/// Per-target settings and collaborators of a poll.
pub struct PollContext<'a> {
    pub read: ReadContext<'a>,
    pub rotation: RotationMode,
    /// Seconds; 0 disables jumping.
    pub max_delay: f64,
    /// The target is a directory plus pattern rather than one fixed file.
    pub is_logrt: bool,
    /// Receives a snapshot after every file step in lines mode.
    pub persister: Option<&'a mut dyn Persister>,
}

/// What a poll produced.
#[derive(Debug)]
pub struct PollOutcome {
    /// The list of the current scan, with progress. `None` keeps the previous list.
    pub files: Option<FileSet>,
    /// Part of the backlog was skipped.
    pub jumped: bool,
    pub result: Result<()>,
}

/// Clamp a modification time from the future to the current time.
pub fn adjust_mtime_to_clock(key: &str, mtime: &mut i64) {
    let now = chrono::Utc::now().timestamp();
    if *mtime > now {
        warn!(
            key,
            mtime = *mtime,
            now, "Modification time is in the future, the clock was probably set back"
        );
        *mtime = now;
    }
}

#[derive(Default)]
struct Poll {
    jumped: bool,
    processed_bytes: u64,
    limit_reached: bool,
}

/// Run one poll of a target.
///
/// `state.cursor` and `state.skip_old_data` are updated in place. The file list is
/// handed back in the outcome and the caller decides whether to keep it.
pub fn process_logrt(
    finder: &mut dyn FileFinder,
    state: &mut TailState,
    budget: &mut LineBudget,
    ctx: &mut PollContext<'_>,
    sink: &mut dyn Sink,
) -> PollOutcome {
    let mut poll = Poll::default();
    let (files, result) = poll.run(finder, state, budget, ctx, sink);

    if ctx.max_delay != 0.0 {
        if result.is_ok() {
            state.processed_bytes = poll.processed_bytes;
        }
        // Only a poll cut short by its budget says anything about the delay
        if result.is_err() || !poll.limit_reached {
            state.start_time = None;
        }
    }

    PollOutcome {
        files,
        jumped: poll.jumped,
        result,
    }
}

impl Poll {
    fn run(
        &mut self,
        finder: &mut dyn FileFinder,
        state: &mut TailState,
        budget: &mut LineBudget,
        ctx: &mut PollContext<'_>,
        sink: &mut dyn Sink,
    ) -> (Option<FileSet>, Result<()>) {
        let key = ctx.read.key;
        adjust_mtime_to_clock(key, &mut state.cursor.mtime);

        let scan = match finder.scan(state.cursor.mtime) {
            Ok(scan) => scan,
            Err(e) => return (None, Err(e)),
        };

        let (mut files, identity_mode) = match scan {
            Scan::Found {
                files,
                identity_mode,
            } => (files, identity_mode),
            Scan::Missing(reason) => {
                // Data appearing later is new data
                state.skip_old_data = false;
                if ctx.is_logrt && state.files.is_empty() {
                    state.cursor.lastlogsize = 0;
                }
                if !ctx.is_logrt {
                    return (None, Err(Error::NoFile(reason)));
                }
                debug!(key, reason = %reason, "No files to read");
                return (None, Ok(()));
            }
        };

        if files.is_empty() {
            debug!(key, "No files to read");
            return (None, Ok(()));
        }
        state.identity_mode = identity_mode;

        let mut seq: u32 = 1;
        let mut start_idx = 0;

        if state.skip_old_data {
            start_idx = files.len() - 1;
            for f in files[..start_idx].iter_mut() {
                f.processed_size = f.size;
                f.seq = seq;
                seq += 1;
            }
            debug!(key, skipped = start_idx, "Skipping old files");
        }

        if !state.files.is_empty() {
            match update_new_list_from_old(
                ctx.rotation,
                &mut state.files,
                &mut files,
                identity_mode,
                &mut seq,
                start_idx,
            ) {
                Ok(cont) => {
                    start_idx = cont.start_idx;
                    if let Some(lastlogsize) = cont.lastlogsize {
                        state.cursor.lastlogsize = lastlogsize;
                    }
                }
                Err(e) => return (None, Err(e)),
            }
        }

        if ctx.rotation == RotationMode::CopyTruncate && files.len() > 1 {
            let old = (!state.files.is_empty()).then_some(&state.files[..]);
            ensure_order_if_mtimes_equal(old, &mut files, identity_mode, &mut start_idx);
        }

        debug!(key, files = ?files, start_idx, "Current file list");

        let mut last_processed = start_idx;

        if ctx.max_delay != 0.0 {
            if let Some(start) = state.start_time {
                let remaining = remaining_bytes(&files);
                if remaining != 0 {
                    let delay = calculate_delay(
                        state.processed_bytes,
                        remaining,
                        start.elapsed().as_secs_f64(),
                    );
                    if delay > ctx.max_delay {
                        let bytes_to_jump =
                            (remaining as f64 * (delay - ctx.max_delay) / delay) as u64;
                        if let Err(e) = jump_ahead(
                            key,
                            &mut files,
                            &mut last_processed,
                            &mut seq,
                            &mut state.cursor,
                            ctx.read.encoding,
                            bytes_to_jump,
                        ) {
                            return (Some(files), Err(e));
                        }
                        self.jumped = true;
                    }
                }
            }
            state.start_time = Some(Instant::now());
        }

        let result = self.read_files(
            &mut files,
            start_idx,
            last_processed,
            &mut seq,
            state,
            budget,
            ctx,
            sink,
        );

        if ctx.rotation == RotationMode::CopyTruncate && files.len() > 1 {
            delay_update_if_copies(
                &mut files,
                &mut state.cursor.mtime,
                &mut state.cursor.lastlogsize,
            );
        }

        for f in files.iter_mut() {
            if let Err(e) = f.refresh_fingerprint() {
                debug!(key, error = %e, "Cannot refresh fingerprint");
            }
        }

        (Some(files), result)
    }

    /// Walk the list from `from`, then once more from the first file.
    #[allow(clippy::too_many_arguments)]
    fn read_files(
        &mut self,
        files: &mut FileSet,
        start_idx: usize,
        from: usize,
        seq: &mut u32,
        state: &mut TailState,
        budget: &mut LineBudget,
        ctx: &mut PollContext<'_>,
        sink: &mut dyn Sink,
    ) -> Result<()> {
        let mut i = from;
        let mut from_first_file = true;

        while i < files.len() {
            let pending = {
                let f = &files[i];
                !f.incomplete && (f.size != f.processed_size || f.seq == 0)
            };

            if pending {
                let processed = self.read_file(files, i, start_idx, state, budget, ctx, sink);

                files[i].seq = *seq;
                *seq += 1;

                if ctx.rotation == RotationMode::CopyTruncate && files.len() > 1 {
                    for k in 0..files.len() - 1 {
                        handle_multiple_copies(files, k);
                    }
                }

                let processed = processed?;
                checkpoint(ctx, &files[i]);

                if ctx.max_delay != 0.0 {
                    self.processed_bytes += processed;
                }

                if budget.exhausted() {
                    self.limit_reached = true;
                    break;
                }
            }

            if from_first_file {
                from_first_file = false;
                i = 0;
                continue;
            }
            i += 1;
        }

        Ok(())
    }

    /// Read file `i` from its offset. Returns the bytes consumed.
    #[allow(clippy::too_many_arguments)]
    fn read_file(
        &self,
        files: &mut [LogFileRecord],
        i: usize,
        start_idx: usize,
        state: &mut TailState,
        budget: &mut LineBudget,
        ctx: &PollContext<'_>,
        sink: &mut dyn Sink,
    ) -> Result<u64> {
        let cursor = &mut state.cursor;
        cursor.mtime = files[i].mtime;

        if i != start_idx {
            cursor.lastlogsize = files[i].processed_size;
        } else if cursor.lastlogsize > files[i].size {
            // An offset past the end is only kept if another file of the same age
            // could be the one it belongs to
            let belongs_elsewhere = files.iter().enumerate().any(|(j, other)| {
                j != i && other.mtime == files[i].mtime && cursor.lastlogsize <= other.size
            });
            if !belongs_elsewhere {
                cursor.lastlogsize = files[i].processed_size;
            }
        }

        let mut seek_offset = if state.skip_old_data {
            debug!(key = ctx.read.key, path = ?files[i].filename, size = files[i].size, "Skipping existing data");
            files[i].size
        } else {
            cursor.lastlogsize
        };

        if ctx.rotation == RotationMode::CopyTruncate {
            let max_processed = max_processed_size_in_copies(files, i);
            if seek_offset < max_processed {
                files[i].processed_size = files[i].size.min(max_processed);
                cursor.lastlogsize = max_processed;
                if files[i].is_fully_processed() {
                    return Ok(0);
                }
                seek_offset = max_processed;
            }
        }

        let result = process_log(
            &mut files[i],
            cursor,
            &mut state.skip_old_data,
            seek_offset,
            budget,
            &ctx.read,
            sink,
        );

        let record = &mut files[i];
        record.processed_size = cursor.lastlogsize;
        if cursor.lastlogsize > record.size {
            record.size = cursor.lastlogsize;
        }

        result
    }
}

/// Durably remember progress on `record`. Count mode persists once per poll instead.
fn checkpoint(ctx: &mut PollContext<'_>, record: &LogFileRecord) {
    if ctx.read.mode != ItemMode::Lines {
        return;
    }
    let Some(persister) = ctx.persister.as_deref_mut() else {
        return;
    };
    if let Err(e) = persister.write(&PersistedRecord::from_record(record)) {
        warn!(key = ctx.read.key, error = %e, "Cannot save progress");
    }
}
