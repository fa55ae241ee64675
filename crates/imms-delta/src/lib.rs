//! # imms-delta
//!
//! Change-feed sync for the immunisation record store.
//!
//! Every committed record mutation arrives as a
//! [`ChangeNotification`](imms_store::ChangeNotification). [`ChangeFeedSync`]
//! flattens it and writes one immutable [`DeltaEntry`] per commit for downstream
//! reporting. Redelivery is a no-op; repeated write failures are dead-lettered.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod dead_letter;
pub mod error;
pub mod flatten;
pub mod sync;
pub mod types;

pub use dead_letter::{DeadLetterSink, InMemoryDeadLetterSink, StorageDeadLetterSink};
pub use error::{DeltaError, Result};
pub use flatten::{ColumnFlattener, FlatRecord, RecordFlattener};
pub use sync::ChangeFeedSync;
pub use types::{DeadLetter, DeltaEntry, SyncOutcome, action_flag};
