// SPDX-License-Identifier: Apache-2.0

//! Skipping ahead when reading falls too far behind the writers (`max_delay`).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::input::file::{Cursor, LogFileRecord, TextEncoding};

/// Buffer used to find a line start after a jump. A multiple of every character width.
const ADJUST_BUF_SIZE: usize = 32 * 1024;

/// Estimated seconds needed to read `remaining_bytes` at the rate observed so far.
///
/// Zero when no rate is known, including when the clock went backwards.
pub fn calculate_delay(processed_bytes: u64, remaining_bytes: u64, t_proc: f64) -> f64 {
    if processed_bytes == 0 || t_proc <= 0.0 {
        return 0.0;
    }

    let delay = remaining_bytes as f64 * t_proc / processed_bytes as f64;
    debug!(
        processed_bytes,
        remaining_bytes,
        t_proc,
        speed = processed_bytes as f64 / t_proc,
        delay,
        "Calculated processing delay"
    );
    delay
}

/// Bytes not yet processed across all files.
pub fn remaining_bytes(files: &[LogFileRecord]) -> u64 {
    files
        .iter()
        .map(|f| f.size.saturating_sub(f.processed_size))
        .sum()
}

/// Mark `bytes_to_jump` bytes as processed without reading them.
///
/// Starts at `start_from` and then continues from the first file. Returns the index
/// of the file the jump ended in, if any bytes were skipped.
fn jump_remaining_bytes(
    key: &str,
    files: &mut [LogFileRecord],
    start_from: usize,
    mut bytes_to_jump: u64,
    seq: &mut u32,
    cursor: &mut Cursor,
) -> Option<usize> {
    let mut jumped_to = None;
    let mut first_pass = true;
    let mut i = start_from;

    while i < files.len() {
        let f = &mut files[i];

        if f.size != f.processed_size {
            let jumped = bytes_to_jump.min(f.size.saturating_sub(f.processed_size));
            let new_processed = f.processed_size + jumped;

            warn!(
                key,
                path = ?f.filename,
                bytes = jumped,
                from = f.processed_size,
                to = new_processed,
                "Skipping log data to meet max delay"
            );

            f.processed_size = new_processed;
            cursor.lastlogsize = new_processed;
            cursor.mtime = f.mtime;
            f.seq = *seq;
            *seq += 1;

            bytes_to_jump -= jumped;
            jumped_to = Some(i);
        }

        if bytes_to_jump == 0 {
            break;
        }

        if first_pass {
            first_pass = false;
            i = 0;
            continue;
        }

        i += 1;
    }

    jumped_to
}

/// Move `cursor.lastlogsize` in `record` to the start of a line.
///
/// Searches forward to the next terminator, then backwards no further than
/// `min_size`. Reaching `min_size` without a terminator leaves the cursor there.
pub fn adjust_position_after_jump(
    record: &mut LogFileRecord,
    cursor: &mut Cursor,
    min_size: u64,
    encoding: &TextEncoding,
) -> Result<()> {
    let path = record.filename.clone();
    let access = |e: io::Error| Error::access(&path, e);

    let mut file = File::open(&record.filename).map_err(access)?;
    let width = encoding.width() as u64;

    let original = cursor.lastlogsize;
    let mut aligned = original;
    if width > 1 {
        let remainder = aligned % width;
        if remainder != 0 {
            aligned = if min_size <= aligned - remainder {
                aligned - remainder
            } else {
                min_size
            };
        }
    }

    let mut buf = vec![0u8; ADJUST_BUF_SIZE];

    file.seek(SeekFrom::Start(aligned)).map_err(access)?;
    let mut pos = aligned;
    loop {
        let n = read_some(&mut file, &mut buf).map_err(access)?;
        if n == 0 {
            break;
        }
        if let Some((_, next)) = encoding.find_newline(&mut buf[..n], 0) {
            return Ok(land(record, cursor, pos + next as u64, original, aligned));
        }
        pos += n as u64;
    }

    // Nothing after the landing point, look behind it
    let mut seek_pos = aligned;
    loop {
        if seek_pos >= ADJUST_BUF_SIZE as u64 {
            seek_pos -= (ADJUST_BUF_SIZE as u64).min(seek_pos - min_size);
        } else {
            seek_pos = min_size;
        }

        file.seek(SeekFrom::Start(seek_pos)).map_err(access)?;
        let n = read_some(&mut file, &mut buf).map_err(access)?;
        if n == 0 {
            return Err(access(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file while looking for a line start",
            )));
        }

        if let Some((_, next)) = encoding.find_newline(&mut buf[..n], 0) {
            return Ok(land(record, cursor, seek_pos + next as u64, original, aligned));
        }

        if seek_pos == min_size {
            return Ok(land(record, cursor, min_size, original, aligned));
        }
    }
}

fn land(record: &mut LogFileRecord, cursor: &mut Cursor, at: u64, original: u64, aligned: u64) {
    debug!(
        path = ?record.filename,
        original,
        aligned,
        adjusted = at,
        "Adjusted position after jump"
    );
    cursor.lastlogsize = at;
    record.processed_size = at;
}

fn read_some(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

/// Skip `bytes_to_jump` bytes starting from file `*jump_from_to` and land on a line start.
///
/// `*jump_from_to` is updated to the file the jump ended in. Within the same file the
/// search never goes back before the pre-jump offset.
pub fn jump_ahead(
    key: &str,
    files: &mut [LogFileRecord],
    jump_from_to: &mut usize,
    seq: &mut u32,
    cursor: &mut Cursor,
    encoding: &TextEncoding,
    bytes_to_jump: u64,
) -> Result<()> {
    let lastlogsize_before = cursor.lastlogsize;

    let Some(jumped_to) =
        jump_remaining_bytes(key, files, *jump_from_to, bytes_to_jump, seq, cursor)
    else {
        return Ok(());
    };

    let min_size = if *jump_from_to == jumped_to {
        lastlogsize_before
    } else {
        *jump_from_to = jumped_to;
        0
    };

    adjust_position_after_jump(&mut files[jumped_to], cursor, min_size, encoding)
}
