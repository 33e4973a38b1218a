// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The seam between a partition executor and its storage engine. The engine
//! is thread-confined to the owning executor, so every method takes
//! `&mut self` and nothing here is `Sync`.

use bytes::Bytes;
use kiln_types::{DependencyId, FragmentId, TxnId, UndoToken};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

/// Output dependencies of one work unit: dependency id to serialized rowset.
pub type DependencySet = BTreeMap<DependencyId, Bytes>;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("access to evicted data in table {table}")]
    EvictedAccess { table: String },

    /// The engine itself is in an unrecoverable state; the caller must crash
    /// the cluster.
    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Returns a summary label for the error
    pub fn get_label(&self) -> &'static str {
        match self {
            EngineError::ConstraintViolation(_) => "constraint_violation",
            EngineError::Sql(_) => "sql",
            EngineError::EvictedAccess { .. } => "evicted_access",
            EngineError::Fatal(_) => "fatal",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StatsSelector {
    Table,
    Index,
    Memory,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TableStats {
    pub table_id: u32,
    pub tuple_count: u64,
    pub tuple_bytes: u64,
}

/// One round of plan-fragment execution.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub fragment_ids: Vec<FragmentId>,
    /// Serialized parameter set per fragment.
    pub params: Vec<Bytes>,
    pub input_deps: DependencySet,
    pub output_dep_ids: Vec<DependencyId>,
    pub txn_id: TxnId,
    pub last_committed_txn: TxnId,
    pub undo_token: UndoToken,
}

/// Storage engine operations the executor core consumes.
///
/// Undo-token contract: `release_undo_token(t)` commits `t` and every lower
/// outstanding token; `undo_undo_token(t)` rolls back `t` and every higher
/// outstanding token. Release calls must arrive with strictly increasing
/// tokens; undo calls arrive LIFO. A release of token `t` followed by an undo
/// of `t' > t` is legal and deterministic: the undo unwinds exactly the
/// still-outstanding range starting at `t'`.
pub trait StorageEngine: Send {
    fn load_catalog(&mut self, catalog: &[u8]) -> Result<(), EngineError>;

    /// Periodic maintenance heartbeat with the current time and the newest
    /// committed transaction.
    fn tick(&mut self, ts_ms: u64, last_committed_txn: TxnId);

    fn execute_plan_fragments(&mut self, work: &WorkUnit) -> Result<DependencySet, EngineError>;

    fn release_undo_token(&mut self, token: UndoToken);

    fn undo_undo_token(&mut self, token: UndoToken);

    fn get_stats(
        &mut self,
        selector: StatsSelector,
        table_ids: &[u32],
        ts_ms: u64,
    ) -> Result<Vec<TableStats>, EngineError>;

    fn load_table(
        &mut self,
        table: &str,
        rows: Bytes,
        txn_id: TxnId,
        last_committed_txn: TxnId,
        undo_token: UndoToken,
        allow_export: bool,
    ) -> Result<(), EngineError>;

    /// Hands the engine input dependencies that arrived ahead of the work
    /// unit that consumes them.
    fn stash_work_unit_dependencies(&mut self, deps: DependencySet);
}
