// SPDX-License-Identifier: Apache-2.0

#[cfg(any(test, feature = "test-util"))]
use std::sync::{Arc, Mutex};

#[cfg(any(test, feature = "test-util"))]
use crate::error::Error;
use crate::error::Result;
use crate::persistence::schema::PersistedRecord;

/// Durable storage for one target's snapshot.
pub trait Persister: Send {
    /// The stored snapshot, `None` if nothing was stored yet.
    fn read(&self) -> Result<Option<PersistedRecord>>;

    /// Replace the stored snapshot.
    fn write(&mut self, record: &PersistedRecord) -> Result<()>;

    /// Delete the stored snapshot. Removing a missing snapshot is not an error.
    fn remove(&mut self) -> Result<()>;
}

impl<P: Persister + ?Sized> Persister for Box<P> {
    fn read(&self) -> Result<Option<PersistedRecord>> {
        (**self).read()
    }

    fn write(&mut self, record: &PersistedRecord) -> Result<()> {
        (**self).write(record)
    }

    fn remove(&mut self) -> Result<()> {
        (**self).remove()
    }
}

/// In-memory persister. Clones share their storage, so a test can keep a handle
/// and inspect what the engine wrote.
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Default)]
pub struct MockPersister {
    data: Arc<Mutex<Option<PersistedRecord>>>,
    fail_writes: bool,
    pub writes: Arc<Mutex<usize>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MockPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `record` already stored.
    pub fn with(record: PersistedRecord) -> Self {
        let p = Self::default();
        if let Ok(mut data) = p.data.lock() {
            *data = Some(record);
        }
        p
    }

    /// Make every write fail.
    pub fn failing(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn stored(&self) -> Option<PersistedRecord> {
        self.data.lock().ok().and_then(|d| d.clone())
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Persister for MockPersister {
    fn read(&self) -> Result<Option<PersistedRecord>> {
        let data = self
            .data
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(data.clone())
    }

    fn write(&mut self, record: &PersistedRecord) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Persistence("simulated write failure".to_string()));
        }
        let mut data = self
            .data
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        *data = Some(record.clone());
        if let Ok(mut w) = self.writes.lock() {
            *w += 1;
        }
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        *data = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_persister_shares_storage() {
        let mock = MockPersister::new();
        let mut handle: Box<dyn Persister> = Box::new(mock.clone());

        assert!(handle.read().unwrap().is_none());
        handle.write(&PersistedRecord::offsets(10, 1)).unwrap();

        assert_eq!(mock.stored(), Some(PersistedRecord::offsets(10, 1)));
        assert_eq!(mock.write_count(), 1);

        handle.remove().unwrap();
        assert!(mock.stored().is_none());
    }

    #[test]
    fn test_failing_mock_keeps_old_value() {
        let mut mock = MockPersister::with(PersistedRecord::offsets(5, 1)).failing();
        assert!(mock.write(&PersistedRecord::offsets(10, 2)).is_err());
        assert_eq!(mock.read().unwrap(), Some(PersistedRecord::offsets(5, 1)));
    }
}
