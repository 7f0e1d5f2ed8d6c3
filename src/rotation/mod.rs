// SPDX-License-Identifier: Apache-2.0

//! Following a log across rotations: matching the files of two scans, carrying
//! progress over, and skipping ahead when reading falls behind.

pub mod copies;
pub mod jump;
pub mod matcher;
pub mod resolver;
pub mod transfer;

pub use jump::{calculate_delay, jump_ahead, remaining_bytes};
pub use matcher::{Identity, build_matrix, classify};
pub use resolver::{Mapping, MappingMatrix};
pub use transfer::{Continuation, update_new_list_from_old};
