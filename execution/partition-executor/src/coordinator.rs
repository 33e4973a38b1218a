// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Interface to the per-site coordinator. The executor core only ever calls
//! these methods; delivery, retries, and inter-site transport live behind
//! the trait.

use crate::message::WorkResultSender;
use bytes::Bytes;
use futures::channel::oneshot;
use kiln_types::{
    message::{WorkFragment, WorkResult},
    PartitionId, SiteId, Status, TxnId,
};

/// A batched work request for one destination site: every fragment the
/// current round sends there, plus the parameter sets they reference.
#[derive(Debug)]
pub struct WorkRequest {
    pub txn_id: TxnId,
    pub base_partition: PartitionId,
    pub procedure: String,
    pub fragments: Vec<WorkFragment>,
    pub params: Vec<Bytes>,
}

pub trait Coordinator: Send + Sync {
    /// Ships one round of work to a remote site. Results come back on
    /// `reply`, one [`WorkResult`] per fragment.
    fn transaction_work(&self, request: WorkRequest, target_site: SiteId, reply: WorkResultSender);

    /// Starts two-phase commit for a transaction across `partitions`. The
    /// callback resolves with the commit decision; the same decision also
    /// arrives at every involved partition as a `Finish` message.
    fn transaction_prepare(
        &self,
        txn_id: TxnId,
        callback: oneshot::Sender<Status>,
        partitions: Vec<PartitionId>,
    );

    /// Broadcasts the terminal decision for a transaction to `partitions`.
    fn transaction_finish(&self, txn_id: TxnId, status: Status, partitions: Vec<PartitionId>);

    /// Pushes a speculatively produced result for a remote transaction back
    /// toward its base partition.
    fn transaction_prefetch_result(&self, txn_id: TxnId, result: WorkResult);

    /// Last resort: an invariant broke inside an executor and the cluster
    /// must come down.
    fn crash_cluster(&self, partition: PartitionId, reason: String);
}
