// SPDX-License-Identifier: Apache-2.0

//! Rotation-aware log tailing.
//!
//! Targets name a single file or a directory plus a file name pattern. Each poll
//! follows the files across rename and copy-truncate rotation, reads new complete
//! lines from the last durable offset and hands matching lines to a [`sink::Sink`].

pub mod check;
pub mod config;
pub mod driver;
pub mod error;
pub mod input;
pub mod persistence;
pub mod receiver;
pub mod rotation;
pub mod sink;
pub mod state;
