// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

use kiln_storage_interface::EngineError;
use kiln_types::UndoToken;
use thiserror::Error;

/// Unrecoverable executor faults. Anything surfacing here crashes the
/// cluster; transaction-level aborts travel as
/// [`kiln_types::TransactionError`] instead.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("work queue disconnected")]
    QueueDisconnected,

    #[error("undo token discipline violated: {0}")]
    UndoTokenViolation(String),

    #[error("timed out after {timeout_ms} ms waiting for {missing} dependencies")]
    ResponseTimeout { timeout_ms: u64, missing: usize },

    #[error("storage engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ExecutorError {
    pub fn undo_violation(message: impl Into<String>, token: UndoToken) -> Self {
        ExecutorError::UndoTokenViolation(format!("{} (token {})", message.into(), token))
    }
}
