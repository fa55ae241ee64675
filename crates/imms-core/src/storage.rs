//! Storage backend abstraction for conditional-write object storage.
//!
//! Every durable piece of pipeline state (records, index claims, ledger entries,
//! acknowledgment artifacts, delta entries) is an object written through this
//! trait. Conditional puts are the only concurrency primitive; listings by prefix
//! back the secondary indexes.
//!
//! Version tokens are opaque strings. [`MemoryBackend`] counts generations per
//! path, starting at 1; a path written after a delete starts over.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Condition a put must satisfy to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Create-only: used for identifier claims, ledger entries and delta entries.
    DoesNotExist,
    /// Replace only the generation read earlier.
    MatchesVersion(String),
    /// Last writer wins.
    None,
}

/// Outcome of a put. A failed precondition is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The object now holds the new data.
    Success {
        /// Generation of the object after this write.
        version: String,
    },
    /// The object was left untouched.
    PreconditionFailed {
        /// Generation found at the path (`"0"` if absent).
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// What `head` and listings report about an object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Full path within the backend.
    pub path: String,
    /// Length of the stored bytes.
    pub size: u64,
    /// Generation to pass back in [`WritePrecondition::MatchesVersion`].
    pub version: String,
    /// Time of the last successful write, if the backend tracks it.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page, in ascending path order.
    pub objects: Vec<ObjectMeta>,
    /// Path to pass as `start_after` for the next page, if more remain.
    pub next_start_after: Option<String>,
}

/// Object storage with conditional puts.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads a whole object; `Error::NotFound` if there is none.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object if `precondition` holds.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Removes an object. Removing a missing object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Every object under `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Lists at most `limit` objects with the given prefix whose path sorts after
    /// `start_after`, in ascending path order.
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage>;

    /// Metadata only; `None` if there is no object.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for tests and local runs.
///
/// Thread-safe via `RwLock`. Versions are numeric generations stored as strings,
/// starting at 1 and incremented on every successful write to the same path.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects held.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path));

        let page: Vec<ObjectMeta> = matching.by_ref().take(limit).collect();
        let has_more = matching.next().is_some();
        let next_start_after = if has_more {
            page.last().map(|m| m.path.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            next_start_after,
        })
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}
