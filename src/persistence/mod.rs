// SPDX-License-Identifier: Apache-2.0

//! Persistence of target progress across restarts.
//!
//! Each target owns one JSON snapshot file written with atomic replacement.

mod gc;
mod json_file;
mod schema;
mod store;

pub use gc::{INACTIVE_RETENTION, InactiveFiles};
pub use json_file::{JsonFilePersister, hash_with_len, persistent_file_path};
pub use schema::PersistedRecord;
#[cfg(any(test, feature = "test-util"))]
pub use store::MockPersister;
pub use store::Persister;
