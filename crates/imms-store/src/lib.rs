//! Versioned vaccination record store.
//!
//! Records live as JSON documents in object storage and are mutated only through
//! single conditional writes. Two secondary indexes sit beside them:
//!
//! - an identifier claim per external identifier, which enforces uniqueness among
//!   active and deleted records
//! - subject markers per subject and category, walked page by page for searches
//!
//! Every committed mutation is published to an injected [`ChangeSink`].
//!
//! The lifecycle rules for create, update, delete and reinstate are expressed as
//! one pure function, [`transition::plan`], so the state machine can be tested
//! without storage.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod change;
pub mod error;
pub mod record;
pub mod store;
pub mod transition;

pub use change::{
    ChangeNotification, ChangeOperation, ChangeSink, DiscardChangeSink, InMemoryChangeFeed,
};
pub use error::{ErrorKind, Result, StoreError};
pub use record::{ExternalIdentifier, LifecycleState, Record, RecordPayload};
pub use store::{RecordStore, RecordStoreConfig};
pub use transition::{Plan, Rejection, RequestedMutation, Transition, WriteCondition};
