//! Fixtures for pipeline tests: a recording storage backend, a per-test
//! scoped environment, bulk-file builders and assertions over storage calls.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Routes `imms` debug logs to the test writer. Safe to call repeatedly.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("imms=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
