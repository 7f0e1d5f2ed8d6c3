// SPDX-License-Identifier: Apache-2.0

pub mod file;

pub use file::{FileFinder, FileSet, Fingerprint, LogFileRecord, Scan, TextEncoding};
