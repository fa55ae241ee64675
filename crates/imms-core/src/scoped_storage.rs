//! Environment-scoped storage with the pipeline's path layout.
//!
//! All paths are prefixed with `env={environment}/`. The layout under that prefix:
//!
//! ```text
//! records/{record_id}.json                              record documents
//! changes/pending/{record_id}/{sequence}.json           unpublished change notifications
//! index/identifier/{sha256(system, value)}.json         external identifier claims
//! index/subject/{sha256(subject)}/{category}/{id}.json  subject + category markers
//! ledger/entries/{message_id}.json                      file audit entries
//! ledger/by-file/{sha256(file_key)}/{message_id}.json   file key lookup markers
//! ledger/by-queue/{queue_key}/{message_id}.json         queue key lookup markers
//! ledger/slots/{queue_key}.json                         one-processing slot per queue
//! source/{incoming|processing|archive}/{file_key}       bulk source files
//! ack/temp/{name}  ack/forwarded/{name}  ack/{name}     acknowledgment artifacts
//! delta/entries/{event_id}.json                         change-feed delta entries
//! delta/dead-letter/{id}.json                           undeliverable notifications
//! ```
//!
//! # Security
//!
//! Path traversal attempts (`..`) and absolute paths are rejected, and the
//! environment name is validated at construction.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{ListPage, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Source file locations as a file moves through intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStage {
    /// Newly arrived, not yet picked up.
    Incoming,
    /// Being streamed by the row processor.
    Processing,
    /// Done (processed or rejected).
    Archive,
}

impl SourceStage {
    fn dir(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Processing => "processing",
            Self::Archive => "archive",
        }
    }
}

/// Hashes key parts into a fixed-width path segment.
///
/// Parts are joined with a unit separator so `("a", "bc")` and `("ab", "c")` differ.
#[must_use]
pub fn hashed_segment(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Environment-scoped storage wrapper.
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    environment: String,
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl ScopedStorage {
    /// Creates a new scoped storage wrapper.
    ///
    /// # Errors
    ///
    /// Returns an error if `environment` is empty or contains characters outside
    /// `a-z`, `0-9`, `-` and `_`.
    pub fn new(backend: Arc<dyn StorageBackend>, environment: impl Into<String>) -> Result<Self> {
        let environment = environment.into();
        Self::validate_id(&environment, "environment")?;
        Ok(Self {
            backend,
            environment,
        })
    }

    fn validate_id(id: &str, field: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidIdentifier {
                message: format!("{field} cannot be empty"),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::InvalidIdentifier {
                message: format!(
                    "{field} contains invalid characters (allowed: a-z, 0-9, '-', '_')"
                ),
            });
        }

        Ok(())
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::InvalidInput(format!(
                "absolute paths not allowed: {path}"
            )));
        }

        if path.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "backslashes not allowed in paths: {path}"
            )));
        }

        if path.contains('\n') || path.contains('\r') || path.contains('\0') {
            return Err(Error::InvalidInput(format!(
                "control characters not allowed in paths: {path}"
            )));
        }

        if path.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(Error::InvalidInput(format!(
                "path traversal not allowed: {path}"
            )));
        }

        Ok(())
    }

    /// Validates a caller-supplied value that becomes a single path segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or contains a separator.
    pub fn validate_segment(value: &str, field: &str) -> Result<()> {
        if value.is_empty() || value.contains('/') || value.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "{field} is not a valid path segment: {value:?}"
            )));
        }
        Self::validate_path(value)
    }

    /// Returns the environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the backend for advanced operations.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn scope_prefix(&self) -> String {
        format!("env={}/", self.environment)
    }

    fn scoped_path(&self, path: &str) -> String {
        format!("{}{}", self.scope_prefix(), path)
    }

    fn unscope(&self, meta: ObjectMeta) -> Option<ObjectMeta> {
        let prefix = self.scope_prefix();
        let relative = meta.path.strip_prefix(&prefix)?.to_string();
        Some(ObjectMeta {
            path: relative,
            ..meta
        })
    }

    // === Record store ===

    /// Path to a record document.
    #[must_use]
    pub fn record_path(record_id: &str) -> String {
        format!("records/{record_id}.json")
    }

    /// Path to the claim binding an external identifier to a record.
    #[must_use]
    pub fn identifier_claim_path(system: &str, value: &str) -> String {
        format!("index/identifier/{}.json", hashed_segment(&[system, value]))
    }

    /// Prefix holding subject markers for one subject and category.
    #[must_use]
    pub fn subject_category_prefix(subject_key: &str, category: &str) -> String {
        format!(
            "index/subject/{}/{}/",
            hashed_segment(&[subject_key]),
            category.to_ascii_uppercase()
        )
    }

    /// Path to one subject marker.
    #[must_use]
    pub fn subject_marker_path(subject_key: &str, category: &str, record_id: &str) -> String {
        format!(
            "{}{record_id}.json",
            Self::subject_category_prefix(subject_key, category)
        )
    }

    /// Prefix holding every unpublished change notification.
    pub const PENDING_CHANGES_PREFIX: &'static str = "changes/pending/";

    /// Prefix holding the unpublished change notifications of one record.
    #[must_use]
    pub fn pending_changes_prefix(record_id: &str) -> String {
        format!("{}{record_id}/", Self::PENDING_CHANGES_PREFIX)
    }

    /// Path to one unpublished change notification. `sequence` orders a record's
    /// notifications by commit.
    #[must_use]
    pub fn pending_change_path(record_id: &str, sequence: &str) -> String {
        format!("{}{sequence}.json", Self::pending_changes_prefix(record_id))
    }

    // === File audit ledger ===

    /// Path to a ledger entry.
    #[must_use]
    pub fn ledger_entry_path(message_id: &str) -> String {
        format!("ledger/entries/{message_id}.json")
    }

    /// Prefix holding the file-key lookup markers for one file key.
    #[must_use]
    pub fn ledger_file_prefix(file_key: &str) -> String {
        format!("ledger/by-file/{}/", hashed_segment(&[file_key]))
    }

    /// Prefix holding the queue-key lookup markers for one queue.
    #[must_use]
    pub fn ledger_queue_prefix(queue_key: &str) -> String {
        format!("ledger/by-queue/{queue_key}/")
    }

    /// Path to the processing slot of a queue.
    #[must_use]
    pub fn queue_slot_path(queue_key: &str) -> String {
        format!("ledger/slots/{queue_key}.json")
    }

    // === Source files and acknowledgments ===

    /// Path to a source file at a given stage.
    #[must_use]
    pub fn source_path(stage: SourceStage, file_key: &str) -> String {
        format!("source/{}/{file_key}", stage.dir())
    }

    /// Path to a partial (accumulating) acknowledgment artifact.
    #[must_use]
    pub fn ack_temp_path(name: &str) -> String {
        format!("ack/temp/{name}")
    }

    /// Path to a finalized acknowledgment artifact.
    #[must_use]
    pub fn ack_forwarded_path(name: &str) -> String {
        format!("ack/forwarded/{name}")
    }

    /// Path to a file-level acknowledgment.
    #[must_use]
    pub fn file_ack_path(name: &str) -> String {
        format!("ack/{name}")
    }

    // === Change feed ===

    /// Path to a delta entry.
    #[must_use]
    pub fn delta_entry_path(event_id: &str) -> String {
        format!("delta/entries/{event_id}.json")
    }

    /// Path to a dead-lettered notification.
    #[must_use]
    pub fn dead_letter_path(id: &str) -> String {
        format!("delta/dead-letter/{id}.json")
    }

    // === Raw operations ===

    /// Reads data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the object is not found.
    pub async fn get_raw(&self, path: &str) -> Result<Bytes> {
        Self::validate_path(path)?;
        self.backend.get(&self.scoped_path(path)).await
    }

    /// Writes data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the backend fails.
    pub async fn put_raw(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        Self::validate_path(path)?;
        self.backend
            .put(&self.scoped_path(path), data, precondition)
            .await
    }

    /// Deletes data at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the backend fails.
    pub async fn delete(&self, path: &str) -> Result<()> {
        Self::validate_path(path)?;
        self.backend.delete(&self.scoped_path(path)).await
    }

    /// Gets metadata at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the backend fails.
    pub async fn head_raw(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Self::validate_path(path)?;
        Ok(self
            .backend
            .head(&self.scoped_path(path))
            .await?
            .and_then(|meta| self.unscope(meta)))
    }

    /// Lists objects under a scope-relative prefix, sorted by path.
    ///
    /// Returned paths are scope-relative.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Self::validate_path(prefix)?;
        let mut metas: Vec<ObjectMeta> = self
            .backend
            .list(&self.scoped_path(prefix))
            .await?
            .into_iter()
            .filter_map(|m| self.unscope(m))
            .collect();
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(metas)
    }

    /// Lists one page under a scope-relative prefix.
    ///
    /// `start_after` and the returned cursor are scope-relative.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or the backend fails.
    pub async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        Self::validate_path(prefix)?;
        let scoped_after = start_after.map(|p| self.scoped_path(p));
        let page = self
            .backend
            .list_page(&self.scoped_path(prefix), scoped_after.as_deref(), limit)
            .await?;
        let prefix_len = self.scope_prefix().len();
        Ok(ListPage {
            objects: page
                .objects
                .into_iter()
                .filter_map(|m| self.unscope(m))
                .collect(),
            next_start_after: page
                .next_start_after
                .and_then(|p| p.get(prefix_len..).map(str::to_string)),
        })
    }

    // === JSON documents ===

    /// Reads and decodes a JSON document together with its version token.
    ///
    /// Returns `None` if the object does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the document does not decode.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<(T, String)>> {
        let Some(meta) = self.head_raw(path).await? else {
            return Ok(None);
        };
        let data = match self.get_raw(path).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let value = serde_json::from_slice(&data)?;
        Ok(Some((value, meta.version)))
    }

    /// Encodes and writes a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the backend fails.
    pub async fn write_json<T: Serialize + Sync>(
        &self,
        path: &str,
        value: &T,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let data = serde_json::to_vec(value)?;
        self.put_raw(path, Bytes::from(data), precondition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_paths_match_layout() {
        assert_eq!(ScopedStorage::record_path("abc"), "records/abc.json");
        assert_eq!(
            ScopedStorage::ledger_entry_path("01HX"),
            "ledger/entries/01HX.json"
        );
        assert_eq!(
            ScopedStorage::queue_slot_path("ABC12_COVID"),
            "ledger/slots/ABC12_COVID.json"
        );
        assert_eq!(
            ScopedStorage::source_path(SourceStage::Processing, "f.csv"),
            "source/processing/f.csv"
        );
        assert_eq!(
            ScopedStorage::pending_change_path("r1", "00000000000000000001-0"),
            "changes/pending/r1/00000000000000000001-0.json"
        );
        assert!(ScopedStorage::identifier_claim_path("sys", "v")
            .starts_with("index/identifier/"));
        assert!(
            ScopedStorage::subject_marker_path("9000000009", "covid", "r1")
                .ends_with("/COVID/r1.json")
        );
    }

    #[test]
    fn test_hashed_segment_separates_parts() {
        assert_ne!(hashed_segment(&["a", "bc"]), hashed_segment(&["ab", "c"]));
        assert_eq!(hashed_segment(&["x"]).len(), 64);
    }

    #[test]
    fn test_environment_validation() {
        let backend = Arc::new(MemoryBackend::new());
        assert!(ScopedStorage::new(backend.clone(), "").is_err());
        assert!(ScopedStorage::new(backend.clone(), "Prod").is_err());
        assert!(ScopedStorage::new(backend.clone(), "a/b").is_err());
        assert!(ScopedStorage::new(backend, "internal-dev").is_ok());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = ScopedStorage::new(backend, "int").unwrap();

        let result = storage
            .put_raw("../other/x", Bytes::from("x"), WritePrecondition::None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(storage.get_raw("/etc/passwd").await.is_err());
        assert!(ScopedStorage::validate_segment("a/b", "file key").is_err());
    }

    #[tokio::test]
    async fn test_environment_isolation() {
        let backend = Arc::new(MemoryBackend::new());
        let int = ScopedStorage::new(backend.clone(), "int").unwrap();
        let prod = ScopedStorage::new(backend, "prod").unwrap();

        int.put_raw("x.txt", Bytes::from("int"), WritePrecondition::None)
            .await
            .expect("put");
        prod.put_raw("x.txt", Bytes::from("prod"), WritePrecondition::None)
            .await
            .expect("put");

        assert_eq!(int.get_raw("x.txt").await.expect("get"), "int");
        assert_eq!(prod.get_raw("x.txt").await.expect("get"), "prod");

        let listed = int.list("").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "x.txt");
    }

    #[tokio::test]
    async fn test_json_roundtrip_with_version() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = ScopedStorage::new(backend, "int").unwrap();

        assert!(storage
            .read_json::<serde_json::Value>("doc.json")
            .await
            .expect("read")
            .is_none());

        storage
            .write_json(
                "doc.json",
                &serde_json::json!({"n": 1}),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("write");

        let (value, version) = storage
            .read_json::<serde_json::Value>("doc.json")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(value["n"], 1);
        assert_eq!(version, "1");
    }

    #[tokio::test]
    async fn test_list_page_cursor_is_scope_relative() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = ScopedStorage::new(backend, "int").unwrap();
        for i in 0..5 {
            storage
                .put_raw(&format!("p/{i}"), Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        let mut cursor: Option<String> = None;
        let mut seen = Vec::new();
        loop {
            let page = storage
                .list_page("p/", cursor.as_deref(), 2)
                .await
                .expect("page");
            seen.extend(page.objects.into_iter().map(|m| m.path));
            match page.next_start_after {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec!["p/0", "p/1", "p/2", "p/3", "p/4"]);
    }
}
