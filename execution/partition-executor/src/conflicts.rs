// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Conflict checking for speculative candidates: may transaction T run
//! at this partition while distributed transaction D holds it? Decisions are
//! made from the static table footprints in the procedure catalog, never
//! from data.

use kiln_types::{
    procedure::ProcedureCatalog, transaction::TransactionState, PartitionId,
};
use std::sync::Arc;

pub trait ConflictChecker: Send {
    /// True when `candidate` is safe to run speculatively under `dtxn`.
    fn can_speculate(
        &self,
        dtxn: &TransactionState,
        candidate: &TransactionState,
        partition: PartitionId,
    ) -> bool;
}

/// Catalog-driven checker: a candidate conflicts when its table footprint
/// intersects the dtxn's with a write on either side.
pub struct TableConflictChecker {
    catalog: Arc<ProcedureCatalog>,
}

impl TableConflictChecker {
    pub fn new(catalog: Arc<ProcedureCatalog>) -> Self {
        Self { catalog }
    }
}

impl ConflictChecker for TableConflictChecker {
    fn can_speculate(
        &self,
        dtxn: &TransactionState,
        candidate: &TransactionState,
        _partition: PartitionId,
    ) -> bool {
        match (
            self.catalog.get(&dtxn.procedure),
            self.catalog.get(&candidate.procedure),
        ) {
            (Some(d), Some(c)) => !d.conflicts_with(&c),
            // Unknown footprints cannot be proven safe.
            _ => false,
        }
    }
}

/// Checker that refuses every candidate. Turns the scheduler's conflict-aware
/// speculation types into pure stall-point speculation.
pub struct PessimisticConflictChecker;

impl ConflictChecker for PessimisticConflictChecker {
    fn can_speculate(
        &self,
        _dtxn: &TransactionState,
        _candidate: &TransactionState,
        _partition: PartitionId,
    ) -> bool {
        false
    }
}
