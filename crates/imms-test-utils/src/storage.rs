//! Test storage with operation tracing and failure injection.
//!
//! Wraps [`MemoryBackend`] so conditional-write semantics are identical to the
//! backend used by local runs; this layer only observes and sabotages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use imms_core::error::{Error, Result};
use imms_core::storage::{
    ListPage, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// One call made against the backend, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// `get`
    Get {
        /// Scoped path.
        path: String,
    },
    /// `head`
    Head {
        /// Scoped path.
        path: String,
    },
    /// `put`, recorded only if no failure was injected.
    Put {
        /// Scoped path.
        path: String,
        /// Bytes written.
        size: usize,
        /// Condition the caller asked for.
        precondition: WritePrecondition,
    },
    /// `delete`
    Delete {
        /// Scoped path.
        path: String,
    },
    /// `list` or `list_page`
    List {
        /// Listed prefix.
        prefix: String,
    },
}

impl StorageOp {
    /// Path or prefix the operation touched.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
}

/// [`MemoryBackend`] that records every call and fails on request.
///
/// Failure rules match on a path *fragment* (substring), so tests can target
/// scope-relative locations such as `delta/entries/` without knowing the scope.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    fail_puts: Arc<Mutex<HashMap<String, usize>>>,
}

impl TracingMemoryBackend {
    /// Creates an empty backend with no failure rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls recorded so far.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Forgets recorded calls; stored objects stay.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every operation whose path contains `fragment`.
    pub fn inject_failure(&self, fragment: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(fragment.into());
    }

    /// Fails the next `times` puts whose path contains `fragment`.
    pub fn fail_next_puts(&self, fragment: impl Into<String>, times: usize) {
        self.fail_puts
            .lock()
            .expect("lock")
            .insert(fragment.into(), times);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
        self.fail_puts.lock().expect("lock").clear();
    }

    /// Returns all stored paths containing `fragment`, sorted.
    pub async fn paths_containing(&self, fragment: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list("")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.path)
            .filter(|p| p.contains(fragment))
            .collect();
        paths.sort();
        paths
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.contains(p.as_str())) {
            return Err(Error::Internal {
                message: format!("Injected failure for path: {path}"),
            });
        }
        Ok(())
    }

    fn check_put_failure(&self, path: &str) -> Result<()> {
        let mut fail_puts = self.fail_puts.lock().expect("lock");
        let hit = fail_puts
            .iter_mut()
            .find(|(fragment, remaining)| **remaining > 0 && path.contains(fragment.as_str()));
        if let Some((_, remaining)) = hit {
            *remaining -= 1;
            return Err(Error::storage(format!("Injected put failure for path: {path}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_failure(path)?;
        self.check_put_failure(path)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_failure(path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list_page(prefix, start_after, limit).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }
}
