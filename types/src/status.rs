// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::ids::PartitionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal status of a transaction at a partition, carried on finish
/// messages, work results, and client responses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Status {
    Ok,
    /// The procedure aborted voluntarily.
    AbortUser,
    /// The predicted partition set was wrong; requeue as multi-partition.
    AbortMispredict,
    /// Invalidated by a cascading speculative rollback; requeue.
    AbortSpeculative,
    /// Touched an evicted tuple; the anti-cache layer fetches and retries.
    AbortEvictedAccess,
    /// The partition is in halt mode; no engine work was done.
    AbortReject,
    /// Constraint violation, SQL error, or other engine failure.
    AbortUnexpected,
}

impl Status {
    pub fn is_abort(self) -> bool {
        !matches!(self, Status::Ok)
    }

    /// Aborts the outer system recovers by re-queuing the transaction.
    pub fn is_requeueable(self) -> bool {
        matches!(self, Status::AbortMispredict | Status::AbortSpeculative)
    }

    /// Returns a summary label for the status
    pub fn get_label(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::AbortUser => "abort_user",
            Status::AbortMispredict => "abort_mispredict",
            Status::AbortSpeculative => "abort_speculative",
            Status::AbortEvictedAccess => "abort_evicted_access",
            Status::AbortReject => "abort_reject",
            Status::AbortUnexpected => "abort_unexpected",
        }
    }
}

/// An abort surfaced while running a transaction. These flow back to the
/// procedure caller through fallible returns; none of them is a panic.
#[derive(Clone, Debug, Deserialize, Error, Eq, PartialEq, Serialize)]
pub enum TransactionError {
    #[error("user abort: {0}")]
    User(String),

    #[error("misprediction: transaction touched partitions {touched:?}")]
    Mispredict { touched: Vec<PartitionId> },

    #[error("speculative execution invalidated by cascading rollback")]
    Speculative,

    #[error("access to evicted data in table {table}")]
    EvictedAccess { table: String },

    #[error("partition is rejecting new transactions")]
    Reject,

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl TransactionError {
    pub fn status(&self) -> Status {
        match self {
            TransactionError::User(_) => Status::AbortUser,
            TransactionError::Mispredict { .. } => Status::AbortMispredict,
            TransactionError::Speculative => Status::AbortSpeculative,
            TransactionError::EvictedAccess { .. } => Status::AbortEvictedAccess,
            TransactionError::Reject => Status::AbortReject,
            TransactionError::Unexpected(_) => Status::AbortUnexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels_are_distinct() {
        let all = [
            Status::Ok,
            Status::AbortUser,
            Status::AbortMispredict,
            Status::AbortSpeculative,
            Status::AbortEvictedAccess,
            Status::AbortReject,
            Status::AbortUnexpected,
        ];
        let labels: std::collections::HashSet<_> = all.iter().map(|s| s.get_label()).collect();
        assert_eq!(labels.len(), all.len());
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(
            TransactionError::Mispredict { touched: vec![1] }.status(),
            Status::AbortMispredict
        );
        assert!(TransactionError::Speculative.status().is_requeueable());
        assert!(!TransactionError::User("done".to_string())
            .status()
            .is_requeueable());
    }
}
