//! Dead-letter channel for notifications that could not be synced.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use imms_core::scoped_storage::hashed_segment;
use imms_core::{ScopedStorage, WritePrecondition};

use crate::error::{DeltaError, Result};
use crate::types::DeadLetter;

/// Receiver of notifications that exhausted their write attempts.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Stores one dead letter.
    ///
    /// # Errors
    ///
    /// Returns an error if the letter could not be stored.
    async fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// Dead letters stored as JSON documents under `delta/dead-letter/`.
#[derive(Debug, Clone)]
pub struct StorageDeadLetterSink {
    storage: ScopedStorage,
}

impl StorageDeadLetterSink {
    /// Creates a sink over `storage`.
    #[must_use]
    pub const fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeadLetterSink for StorageDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        let path = ScopedStorage::dead_letter_path(&hashed_segment(&[&letter.notification.event_id]));
        self.storage
            .write_json(&path, &letter, WritePrecondition::None)
            .await?;
        Ok(())
    }
}

/// In-memory sink for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every letter received so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.letters.read().map_err(poison_err)?.clone())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> DeltaError {
    DeltaError::dead_letter("-", "dead-letter lock poisoned")
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        self.letters.write().map_err(poison_err)?.push(letter);
        Ok(())
    }
}
