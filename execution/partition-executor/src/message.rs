// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Internal messages destined for one partition's work queue. Only the
//! owning executor dequeues them; peers, the coordinator, and the
//! initializer enqueue.

use bytes::Bytes;
use futures::channel::oneshot;
use kiln_storage_interface::{StatsSelector, TableStats};
use kiln_types::{
    message::{BatchPlan, WorkFragment, WorkResult},
    transaction::{NewTransactionRequest, TransactionState},
    PartitionId, Status, TxnId,
};

/// Channel on which fragment results travel back to the dispatching
/// partition.
pub type WorkResultSender = crossbeam_channel::Sender<WorkResult>;

#[derive(Debug)]
pub enum InternalMessage {
    /// Run a transaction that has been released to this partition.
    StartTxn { txn_id: TxnId },

    /// One round of plan fragments for a distributed transaction.
    WorkFragment {
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: String,
        params: Vec<Bytes>,
        fragment: WorkFragment,
        reply: WorkResultSender,
    },

    /// Two-phase commit phase one for the given transaction.
    Prepare {
        txn_id: TxnId,
        callback: Option<oneshot::Sender<PartitionId>>,
    },

    /// Terminal commit/abort decision for the given transaction.
    Finish { txn_id: TxnId, status: Status },

    /// A raw client invocation; the executor assigns an id and queues it.
    InitializeRequest { request: NewTransactionRequest },

    /// An already-constructed transaction (restart path) to re-queue.
    InitializeTxn { txn: TransactionState },

    /// A remote distributed transaction requesting this partition's lock.
    SetDistributedTxn {
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: String,
        params: Bytes,
        released: Option<oneshot::Sender<PartitionId>>,
    },

    /// A low-priority query deferred until the partition is idle.
    DeferredQuery { txn_id: TxnId, plan: BatchPlan },

    /// Wake-up marker; real utility work happens whenever the queue is idle.
    UtilityWork,

    /// Refresh memory statistics from the storage engine.
    UpdateMemory,

    /// Snapshot maintenance step.
    SnapshotWork,

    TableStatsRequest {
        selector: StatsSelector,
        table_ids: Vec<u32>,
        callback: oneshot::Sender<Vec<TableStats>>,
    },
}

impl InternalMessage {
    /// Returns a summary label for the message variant
    pub fn get_label(&self) -> &'static str {
        match self {
            InternalMessage::StartTxn { .. } => "start_txn",
            InternalMessage::WorkFragment { .. } => "work_fragment",
            InternalMessage::Prepare { .. } => "prepare",
            InternalMessage::Finish { .. } => "finish",
            InternalMessage::InitializeRequest { .. } => "initialize_request",
            InternalMessage::InitializeTxn { .. } => "initialize_txn",
            InternalMessage::SetDistributedTxn { .. } => "set_distributed_txn",
            InternalMessage::DeferredQuery { .. } => "deferred_query",
            InternalMessage::UtilityWork => "utility_work",
            InternalMessage::UpdateMemory => "update_memory",
            InternalMessage::SnapshotWork => "snapshot_work",
            InternalMessage::TableStatsRequest { .. } => "table_stats_request",
        }
    }

    /// The transaction the message concerns, when there is one.
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            InternalMessage::StartTxn { txn_id }
            | InternalMessage::WorkFragment { txn_id, .. }
            | InternalMessage::Prepare { txn_id, .. }
            | InternalMessage::Finish { txn_id, .. }
            | InternalMessage::SetDistributedTxn { txn_id, .. }
            | InternalMessage::DeferredQuery { txn_id, .. } => Some(*txn_id),
            InternalMessage::InitializeTxn { txn } => Some(txn.id),
            InternalMessage::InitializeRequest { .. }
            | InternalMessage::UtilityWork
            | InternalMessage::UpdateMemory
            | InternalMessage::SnapshotWork
            | InternalMessage::TableStatsRequest { .. } => None,
        }
    }
}
