// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Structured logging for Kiln components.
//!
//! Call sites use the macros from [`prelude`] with structured fields:
//!
//! ```ignore
//! use kiln_logger::prelude::*;
//!
//! warn!(error = ?e, partition = p, "error processing work message");
//! ```
//!
//! The macros are the `tracing` macros; this crate owns subscriber setup so
//! binaries and tests configure output in one place.

#![forbid(unsafe_code)]

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub use tracing::{debug, error, info, trace, warn, Level};

pub mod prelude {
    pub use crate::{debug, error, info, trace, warn};
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber at the given level, honoring `RUST_LOG`
/// overrides. Later calls are no-ops so libraries and tests may both call it.
pub fn init(level: Level) {
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}

/// Subscriber setup for unit and integration tests: debug level, test writer
/// so output is captured per test.
pub fn init_for_testing() {
    INITIALIZED.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .init();
    });
}
