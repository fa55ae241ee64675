//! # imms-batch
//!
//! Bulk file ingestion for the immunisation record store.
//!
//! A file moves through these stages:
//!
//! 1. [`intake::FileIntake`] validates the file name and submitter, then records
//!    the arrival on the [`ledger::FileAuditLedger`], which allows one file in
//!    `Processing` per submitter and vaccine category
//! 2. [`processor::BatchRowProcessor`] turns each row into a
//!    [`row::RowEvent`] on the submitter's partition of the row log
//! 3. [`forwarder::RecordForwarder`] applies each event to the record store and
//!    reports a [`row::RowOutcome`]
//! 4. [`ack::AckAccumulator`] gathers outcomes into the acknowledgment artifact
//!    and completes the file once every row is accounted for
//!
//! [`pipeline::LocalPipeline`] wires all of them together in one process.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod ack;
pub mod error;
pub mod file_key;
pub mod forwarder;
pub mod intake;
pub mod ledger;
pub mod log;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod row;
pub mod source;

pub use ack::{AckAccumulator, AppendSummary, FileAckStatus, FinalizeOutcome};
pub use error::{BatchError, Result};
pub use file_key::FileKey;
pub use forwarder::RecordForwarder;
pub use intake::{FileIntake, IntakeDecision};
pub use ledger::{
    AdmitDecision, AdmitRequest, ChannelFileTrigger, EntryAttributes, FileAuditEntry,
    FileAuditLedger, FileStatus, FileTrigger, LoggingFileTrigger, NotProcessedReason,
};
pub use log::{PartitionedLog, RowEventLog};
pub use pipeline::LocalPipeline;
pub use policy::{
    MandatoryFieldValidator, PermissionPolicy, RowValidator, StaticPermissionPolicy,
    StaticSubmitterDirectory, SubmitterDirectory,
};
pub use processor::{BatchRowProcessor, ProcessSummary};
pub use row::{
    AckTarget, OutcomeResult, RequestedOperation, RowEvent, RowInstruction, RowOutcome,
    VaccinationRow,
};
pub use source::SourceArea;
