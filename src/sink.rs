// SPDX-License-Identifier: Apache-2.0

//! The consumer of matched lines.
//!
//! Transmission, buffering and retries toward a collector live behind [`Sink`]; the
//! engine only needs to know whether a value was accepted.

use tower::BoxError;

/// State of a reported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Normal,
    /// The target failed; `value` holds the error message.
    NotSupported,
}

/// Flags attached to a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFlags {
    /// The offset should be durably remembered by the receiver of the value.
    pub persistent: bool,
    /// The value is a count of matching lines rather than a line.
    pub count: bool,
}

/// One value handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValue<'a> {
    pub destination: &'a str,
    pub key: &'a str,
    pub value: &'a str,
    pub state: ItemState,
    /// Offset just past the line.
    pub lastlogsize: u64,
    pub mtime: Option<i64>,
    pub timestamp: Option<i64>,
    pub source: Option<&'a str>,
    pub severity: Option<u16>,
    pub event_id: Option<u64>,
    pub flags: ValueFlags,
}

impl<'a> LogValue<'a> {
    /// A value with no event metadata.
    pub fn line(destination: &'a str, key: &'a str, value: &'a str, lastlogsize: u64) -> Self {
        Self {
            destination,
            key,
            value,
            state: ItemState::Normal,
            lastlogsize,
            mtime: None,
            timestamp: None,
            source: None,
            severity: None,
            event_id: None,
            flags: ValueFlags::default(),
        }
    }
}

/// Accepts values from the tailing engine.
///
/// A rejected value is retried before any newer line on a later poll.
pub trait Sink: Send {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError> {
        (**self).send(value)
    }
}

/// A value captured by [`RecordingSink`].
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedValue {
    pub key: String,
    pub value: String,
    pub state: ItemState,
    pub lastlogsize: u64,
    pub mtime: Option<i64>,
    pub flags: ValueFlags,
}

/// Sink that keeps every accepted value in memory.
///
/// It can be told to reject values after a number of accepted ones, which is how
/// collector backpressure is simulated.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub values: Vec<RecordedValue>,
    accept: Option<usize>,
    pub rejected: usize,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject everything after `n` more accepted values.
    pub fn reject_after(mut self, n: usize) -> Self {
        self.accept = Some(n);
        self
    }

    /// Accept everything again.
    pub fn accept_all(&mut self) {
        self.accept = None;
    }

    pub fn lines(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.value.as_str()).collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Sink for RecordingSink {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError> {
        if let Some(remaining) = self.accept.as_mut() {
            if *remaining == 0 {
                self.rejected += 1;
                return Err("sink is full".into());
            }
            *remaining -= 1;
        }

        self.values.push(RecordedValue {
            key: value.key.to_string(),
            value: value.value.to_string(),
            state: value.state,
            lastlogsize: value.lastlogsize,
            mtime: value.mtime,
            flags: value.flags,
        });
        Ok(())
    }
}
