// SPDX-License-Identifier: Apache-2.0

//! Discovering, identifying and reading the files of a target.

mod encoding;
mod file_id;
mod finder;
pub mod fingerprint;
mod pattern;
mod reader;
mod record;

pub use encoding::TextEncoding;
pub use file_id::{FileId, IdentityMode, Place};
#[cfg(any(test, feature = "test-util"))]
pub use finder::MockFileFinder;
pub use finder::{DirectoryFinder, FileFinder, Scan, SingleFileFinder};
pub use fingerprint::{Fingerprint, MAX_BLOCK_SIZE};
pub use pattern::LineMatcher;
pub use reader::{Cursor, LineBudget, READ_BUF_SIZE, ReadContext, process_log, read_records};
pub use record::{FileSet, LogFileRecord, mtime_secs};
