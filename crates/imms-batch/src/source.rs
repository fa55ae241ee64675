//! Source file locations.
//!
//! A file lands in `source/incoming/`, moves to `source/processing/` when its
//! queue is free, and ends in `source/archive/` once acknowledged or rejected.

use bytes::Bytes;

use imms_core::scoped_storage::SourceStage;
use imms_core::{ScopedStorage, WritePrecondition};

use crate::error::Result;

/// Source file area within scoped storage.
#[derive(Debug, Clone)]
pub struct SourceArea {
    storage: ScopedStorage,
}

impl SourceArea {
    /// Creates a source area over `storage`.
    #[must_use]
    pub const fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    /// Stores a newly arrived file.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid path or storage fails.
    pub async fn put_incoming(&self, file_key: &str, data: Bytes) -> Result<()> {
        self.storage
            .put_raw(
                &ScopedStorage::source_path(SourceStage::Incoming, file_key),
                data,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Reads a file at `stage`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn read(&self, stage: SourceStage, file_key: &str) -> Result<Option<Bytes>> {
        match self
            .storage
            .get_raw(&ScopedStorage::source_path(stage, file_key))
            .await
        {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Moves a file between stages. Returns `false` if it was not at `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn move_to(&self, file_key: &str, from: SourceStage, to: SourceStage) -> Result<bool> {
        let Some(data) = self.read(from, file_key).await? else {
            tracing::debug!(file_key, ?from, ?to, "source file not present, nothing to move");
            return Ok(false);
        };
        self.storage
            .put_raw(
                &ScopedStorage::source_path(to, file_key),
                data,
                WritePrecondition::None,
            )
            .await?;
        self.storage
            .delete(&ScopedStorage::source_path(from, file_key))
            .await?;
        tracing::debug!(file_key, ?from, ?to, "source file moved");
        Ok(true)
    }
}
