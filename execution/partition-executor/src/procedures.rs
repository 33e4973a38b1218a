// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Stored-procedure execution surface. Procedure control code runs on the
//! executor thread and talks back to the partition through
//! [`ProcedureContext`]; every statement batch it issues goes through the
//! fragment dispatcher.

use crate::executor::PartitionExecutor;
use bytes::Bytes;
use kiln_storage_interface::DependencySet;
use kiln_types::{message::BatchPlan, PartitionId, TransactionError, TxnId};

/// Control code of one stored procedure. Implementations must be pure
/// against the context: all data access goes through `execute_batch`.
pub trait ProcedureRunner: Send + Sync {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError>;
}

/// The executor-side view a running procedure gets.
pub struct ProcedureContext<'a> {
    pub(crate) executor: &'a mut PartitionExecutor,
    pub(crate) txn_id: TxnId,
}

impl ProcedureContext<'_> {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.executor.partition_id()
    }

    pub fn params(&self) -> Bytes {
        self.executor.txn_params(self.txn_id)
    }

    pub fn is_speculative(&self) -> bool {
        self.executor.txn_is_speculative(self.txn_id)
    }

    pub fn restart_count(&self) -> u32 {
        self.executor.txn_restart_count(self.txn_id)
    }

    /// Runs one planned statement batch: local fragments inline, everything
    /// else through peers or the coordinator, blocking until all
    /// dependencies return. Mispredictions and aborts surface as errors.
    pub fn execute_batch(&mut self, plan: BatchPlan) -> Result<DependencySet, TransactionError> {
        self.executor.execute_batch(self.txn_id, plan)
    }

    /// Bulk-loads serialized rows into a local table under this
    /// transaction's undo token (loader sysprocs).
    pub fn load_table(
        &mut self,
        table: &str,
        rows: Bytes,
        allow_export: bool,
    ) -> Result<(), TransactionError> {
        self.executor.load_table(self.txn_id, table, rows, allow_export)
    }

    /// Sysproc-only: put the partition into halt mode. New non-sysproc
    /// transactions are rejected until the site restarts.
    pub fn halt_partition(&mut self) {
        self.executor.halt_partition();
    }
}

/// The `@Halt` system procedure: flips the executing partition into
/// reject-all mode. Register it under a sysproc catalog entry.
pub struct HaltProcedure;

impl ProcedureRunner for HaltProcedure {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        ctx.halt_partition();
        Ok(Bytes::new())
    }
}
