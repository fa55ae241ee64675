//! # imms-core
//!
//! Shared primitives for the immunisation ingestion pipeline.
//!
//! This crate provides the foundations every pipeline component builds on:
//!
//! - **Storage**: the conditional-write object storage contract and an in-memory backend
//! - **Scoping**: environment-scoped storage with the pipeline's path layout
//! - **Identifiers**: strongly-typed record and message IDs
//! - **Configuration**: environment-driven pipeline settings
//! - **Observability**: logging initialization, span helpers and metric names
//! - **Delimited text**: the pipe-delimited line codec shared by bulk files and acks
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use imms_core::prelude::*;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let storage = ScopedStorage::new(backend, "int").expect("valid environment");
//! assert_eq!(storage.environment(), "int");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod delimited;
pub mod error;
pub mod id;
pub mod metrics;
pub mod observability;
pub mod scoped_storage;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::id::{MessageId, RecordId};
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        ListPage, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use id::{MessageId, RecordId};
pub use observability::{LogFormat, init_logging};
pub use scoped_storage::ScopedStorage;
pub use storage::{
    ListPage, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
