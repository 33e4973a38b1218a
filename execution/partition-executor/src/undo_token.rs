// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Undo-token discipline for one partition. Tokens are allocated
//! monotonically; the storage engine commits them in strictly increasing
//! order and rolls them back LIFO. Everything here is owned by the executor
//! thread.

use crate::error::ExecutorError;
use kiln_types::{
    first_undo_token, is_real_undo_token, transaction::PartitionWork, PartitionId, UndoToken,
    DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN,
};
use std::collections::BTreeSet;

/// What kind of execution round a token is being chosen for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoundKind {
    /// Speculative rounds always log under a fresh token so a cascading
    /// rollback can unwind them individually.
    Speculative,
    ReadOnly,
    Write {
        multi_partition: bool,
        /// The estimator declared the remainder of the transaction
        /// non-abortable and read-only past this point.
        remainder_safe: bool,
    },
}

#[derive(Debug)]
pub struct UndoTokenManager {
    partition: PartitionId,
    last_token: UndoToken,
    last_committed: UndoToken,
    outstanding: BTreeSet<UndoToken>,
    force_undo: bool,
}

impl UndoTokenManager {
    pub fn new(partition: PartitionId, force_undo: bool) -> Self {
        let base = first_undo_token(partition);
        Self {
            partition,
            last_token: base,
            last_committed: base,
            outstanding: BTreeSet::new(),
            force_undo,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn last_token(&self) -> UndoToken {
        self.last_token
    }

    pub fn last_committed(&self) -> UndoToken {
        self.last_committed
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn max_outstanding(&self) -> Option<UndoToken> {
        self.outstanding.iter().next_back().copied()
    }

    /// Largest outstanding token strictly below `bound`. This is the single
    /// release point that commits every speculative round layered beneath an
    /// aborting dtxn's first write.
    pub fn max_outstanding_below(&self, bound: UndoToken) -> Option<UndoToken> {
        self.outstanding.range(..bound).next_back().copied()
    }

    pub fn next(&mut self) -> UndoToken {
        self.last_token += 1;
        self.outstanding.insert(self.last_token);
        self.last_token
    }

    /// Chooses the token for the next execution round of a transaction whose
    /// per-partition history is `work`.
    pub fn acquire(&mut self, work: &PartitionWork, round: RoundKind) -> UndoToken {
        match round {
            RoundKind::Speculative => self.next(),
            RoundKind::ReadOnly => {
                if work.last_undo_token == NULL_UNDO_TOKEN {
                    DISABLE_UNDO_TOKEN
                } else {
                    work.last_undo_token
                }
            },
            RoundKind::Write {
                multi_partition,
                remainder_safe,
            } => {
                if self.force_undo || multi_partition || work.first_undo_token == NULL_UNDO_TOKEN {
                    self.next()
                } else if remainder_safe {
                    // Fast path: nothing past this point can abort, skip
                    // logging for the rest of the transaction.
                    DISABLE_UNDO_TOKEN
                } else if work.last_undo_token < self.last_token {
                    // A later allocation overtook the reusable token; the
                    // chosen token must stay >= the newest allocation.
                    self.next()
                } else {
                    work.last_undo_token
                }
            },
        }
    }

    /// Validates and records a commit at `token`. Every lower outstanding
    /// token commits with it.
    pub fn commit(&mut self, token: UndoToken) -> Result<(), ExecutorError> {
        if !is_real_undo_token(token) {
            return Err(ExecutorError::undo_violation(
                "commit of a sentinel token",
                token,
            ));
        }
        if token <= self.last_committed {
            return Err(ExecutorError::undo_violation(
                format!("commit at or below last committed {}", self.last_committed),
                token,
            ));
        }
        self.outstanding.retain(|t| *t > token);
        self.last_committed = token;
        Ok(())
    }

    /// Validates and records a rollback at `token`. Every higher outstanding
    /// token rolls back with it.
    pub fn rollback(&mut self, token: UndoToken) -> Result<(), ExecutorError> {
        if !is_real_undo_token(token) {
            return Err(ExecutorError::undo_violation(
                "rollback of a sentinel token",
                token,
            ));
        }
        if token <= self.last_committed {
            return Err(ExecutorError::undo_violation(
                format!(
                    "rollback at or below last committed {}",
                    self.last_committed
                ),
                token,
            ));
        }
        self.outstanding.retain(|t| *t < token);
        Ok(())
    }
}
