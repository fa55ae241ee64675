//! In-process wiring of every ingestion component.
//!
//! [`LocalPipeline`] runs intake, row processing, forwarding and acknowledgment
//! against one storage backend, with in-memory stand-ins for the row log, the
//! release channel and the change feed. Used by the `imms-ingest` binary and by
//! end-to-end tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use imms_core::scoped_storage::SourceStage;
use imms_core::{MessageId, PipelineConfig, ScopedStorage, StorageBackend};
use imms_store::{InMemoryChangeFeed, RecordStore, RecordStoreConfig};

use crate::ack::AckAccumulator;
use crate::error::Result;
use crate::forwarder::RecordForwarder;
use crate::intake::{FileIntake, IntakeDecision};
use crate::ledger::{ChannelFileTrigger, EntryAttributes, FileAuditEntry, FileAuditLedger, FileStatus};
use crate::log::PartitionedLog;
use crate::policy::{MandatoryFieldValidator, PermissionPolicy, SubmitterDirectory};
use crate::processor::BatchRowProcessor;
use crate::row::{AckTarget, RowEvent, RowOutcome};
use crate::source::SourceArea;

/// Events forwarded per partition poll.
const FORWARD_BATCH: usize = 50;

/// Every component wired over one storage scope.
pub struct LocalPipeline {
    storage: ScopedStorage,
    ledger: FileAuditLedger,
    acks: AckAccumulator,
    sources: SourceArea,
    intake: FileIntake,
    processor: BatchRowProcessor,
    forwarder: RecordForwarder,
    store: RecordStore,
    log: Arc<PartitionedLog<RowEvent>>,
    changes: Arc<InMemoryChangeFeed>,
    released: Mutex<UnboundedReceiver<MessageId>>,
    unacknowledged: Mutex<Vec<(AckTarget, Vec<RowOutcome>)>>,
}

impl std::fmt::Debug for LocalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPipeline")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl LocalPipeline {
    /// Wires the pipeline over `backend`, scoped to `config.environment`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment name is not a valid scope.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: &PipelineConfig,
        directory: Arc<dyn SubmitterDirectory>,
        permissions: Arc<dyn PermissionPolicy>,
    ) -> Result<Self> {
        let storage = ScopedStorage::new(backend, config.environment.clone())?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let ledger = FileAuditLedger::new(storage.clone(), Arc::new(ChannelFileTrigger::new(sender)))
            .with_ttl_days(config.audit_ttl_days)
            .with_max_cas_retries(config.max_cas_retries);
        let acks = AckAccumulator::new(storage.clone(), ledger.clone())
            .with_max_cas_retries(config.max_cas_retries);
        let sources = SourceArea::new(storage.clone());
        let log: Arc<PartitionedLog<RowEvent>> = Arc::new(PartitionedLog::new());
        let changes = Arc::new(InMemoryChangeFeed::new());
        let store = RecordStore::new(storage.clone(), changes.clone())
            .with_config(RecordStoreConfig::from_pipeline(config));

        let intake = FileIntake::new(
            ledger.clone(),
            acks.clone(),
            sources.clone(),
            directory,
            permissions.clone(),
        );
        let processor = BatchRowProcessor::new(
            ledger.clone(),
            acks.clone(),
            sources.clone(),
            log.clone(),
            Arc::new(MandatoryFieldValidator),
            permissions,
        );

        Ok(Self {
            storage,
            ledger,
            acks,
            sources,
            intake,
            processor,
            forwarder: RecordForwarder::new(store.clone()),
            store,
            log,
            changes,
            released: Mutex::new(receiver),
            unacknowledged: Mutex::new(Vec::new()),
        })
    }

    /// Stores a file and runs intake on it. A file that may proceed is streamed
    /// onto the row log straight away.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or the ledger fail.
    pub async fn submit(&self, file_key: &str, data: Bytes) -> Result<IntakeDecision> {
        self.sources.put_incoming(file_key, data).await?;
        let decision = self.intake.receive(MessageId::generate(), file_key).await?;
        if let IntakeDecision::Proceed(entry) = &decision {
            self.process_entry(entry).await?;
        }
        Ok(decision)
    }

    /// Processes released files and forwards row events until nothing is left.
    ///
    /// Returns the number of row events forwarded. Outcomes that could not be
    /// acknowledged are kept and acknowledged first on the next run, so their
    /// events are not forwarded twice.
    ///
    /// # Errors
    ///
    /// Returns an error if any pipeline step fails.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut forwarded = 0;
        loop {
            let parked = std::mem::take(&mut *self.unacknowledged.lock().await);
            let mut progressed = !parked.is_empty();
            self.acknowledge(parked).await?;

            while let Some(message_id) = self.next_released().await {
                progressed = true;
                let Some(entry) = self.ledger.get(message_id).await? else {
                    tracing::warn!(%message_id, "released message has no ledger entry");
                    continue;
                };
                self.process_entry(&entry).await?;
            }

            for partition in self.log.partitions()? {
                let events = self.log.poll(&partition, FORWARD_BATCH)?;
                if events.is_empty() {
                    continue;
                }
                progressed = true;
                forwarded += events.len();
                self.forward_batch(&events).await?;
            }

            if !progressed {
                return Ok(forwarded);
            }
        }
    }

    /// The audit ledger.
    #[must_use]
    pub const fn ledger(&self) -> &FileAuditLedger {
        &self.ledger
    }

    /// The record store.
    #[must_use]
    pub const fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Change notifications committed so far and not yet drained.
    #[must_use]
    pub fn changes(&self) -> &InMemoryChangeFeed {
        &self.changes
    }

    /// The scoped storage everything is written to.
    #[must_use]
    pub const fn storage(&self) -> &ScopedStorage {
        &self.storage
    }

    /// Reads the finalized business acknowledgment of an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn business_ack(&self, entry: &FileAuditEntry) -> Result<Option<String>> {
        self.read_text(&ScopedStorage::ack_forwarded_path(&target_of(entry).bus_ack_name()))
            .await
    }

    /// Reads the file-level acknowledgment of an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn file_ack(&self, entry: &FileAuditEntry) -> Result<Option<String>> {
        self.read_text(&ScopedStorage::file_ack_path(&target_of(entry).inf_ack_name()))
            .await
    }

    /// Returns true if the source of `entry` has reached the archive.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn is_archived(&self, entry: &FileAuditEntry) -> Result<bool> {
        Ok(self
            .sources
            .read(SourceStage::Archive, &entry.file_key)
            .await?
            .is_some())
    }

    async fn next_released(&self) -> Option<MessageId> {
        self.released.lock().await.try_recv().ok()
    }

    async fn process_entry(&self, entry: &FileAuditEntry) -> Result<()> {
        let Some(content) = self.intake.start_processing(entry).await? else {
            self.ledger
                .transition(
                    entry.message_id,
                    FileStatus::Failed,
                    EntryAttributes::default().with_error_details("source file missing"),
                )
                .await?;
            self.ledger.release_next(&entry.queue_key).await?;
            return Ok(());
        };
        let summary = self.processor.process(entry, &content).await?;
        tracing::debug!(file_key = %entry.file_key, ?summary, "file processed");
        Ok(())
    }

    async fn forward_batch(&self, events: &[RowEvent]) -> Result<()> {
        let mut by_file: BTreeMap<MessageId, (AckTarget, Vec<RowOutcome>)> = BTreeMap::new();
        for event in events {
            let outcome = self.forwarder.forward(event).await;
            by_file
                .entry(event.target.message_id)
                .or_insert_with(|| (event.target.clone(), Vec::new()))
                .1
                .push(outcome);
        }
        self.acknowledge(by_file.into_values().collect()).await
    }

    /// Appends and finalizes each file's outcomes. On failure the failed group and
    /// every group after it are parked for the next run.
    async fn acknowledge(&self, groups: Vec<(AckTarget, Vec<RowOutcome>)>) -> Result<()> {
        let mut groups = VecDeque::from(groups);
        while let Some((target, outcomes)) = groups.pop_front() {
            let acked = match self.acks.append(&target, &outcomes).await {
                Ok(_) => self.acks.finalize(&target).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = acked {
                tracing::warn!(file_key = %target.file_key, error = %err, "row outcomes parked");
                let mut parked = self.unacknowledged.lock().await;
                parked.push((target, outcomes));
                parked.extend(groups);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn read_text(&self, path: &str) -> Result<Option<String>> {
        match self.storage.get_raw(path).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn target_of(entry: &FileAuditEntry) -> AckTarget {
    AckTarget {
        message_id: entry.message_id,
        file_key: entry.file_key.clone(),
        created_at_formatted: entry.created_at_formatted(),
    }
}
