// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! The partition lock queue. Transactions wait here in id order, which
//! the lock-queue manager guarantees is the global serial order. The queue
//! holds ids and release callbacks, never transaction ownership.

use futures::channel::oneshot;
use kiln_types::{PartitionId, Status, TxnId};
use std::collections::BTreeMap;

/// One waiter on the partition lock.
#[derive(Debug)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub single_partition: bool,
    /// The waiter's base partition is this partition.
    pub local: bool,
    /// Fired with the partition id when the lock is granted.
    pub on_release: Option<oneshot::Sender<PartitionId>>,
}

impl LockRequest {
    pub fn new(txn_id: TxnId, single_partition: bool, local: bool) -> Self {
        Self {
            txn_id,
            single_partition,
            local,
            on_release: None,
        }
    }

    pub fn with_release_callback(mut self, callback: oneshot::Sender<PartitionId>) -> Self {
        self.on_release = Some(callback);
        self
    }
}

#[derive(Debug)]
pub struct LockQueue {
    partition: PartitionId,
    queue: BTreeMap<TxnId, LockRequest>,
}

impl LockQueue {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            queue: BTreeMap::new(),
        }
    }

    /// Queues a waiter. Re-inserting an id that is already waiting is a
    /// protocol error and is ignored.
    pub fn insert(&mut self, request: LockRequest) -> bool {
        let txn_id = request.txn_id;
        if self.queue.contains_key(&txn_id) {
            return false;
        }
        self.queue.insert(txn_id, request);
        true
    }

    /// Grants the lock to the oldest waiter, firing its release callback.
    pub fn poll(&mut self) -> Option<LockRequest> {
        let (_, request) = self.queue.pop_first()?;
        Some(self.release(request))
    }

    /// Removes a specific waiter (speculative dispatch path) and marks it
    /// released.
    pub fn remove(&mut self, txn_id: TxnId) -> Option<LockRequest> {
        let request = self.queue.remove(&txn_id)?;
        Some(self.release(request))
    }

    /// Drops a waiter without granting it: its release callback is never
    /// fired (abort path).
    pub fn cancel(&mut self, txn_id: TxnId) -> bool {
        self.queue.remove(&txn_id).is_some()
    }

    /// Waiters in grant order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LockRequest> {
        self.queue.values()
    }

    /// Waiters in grant order starting strictly after `txn_id`.
    pub fn iter_after(&self, txn_id: TxnId) -> impl Iterator<Item = &LockRequest> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.queue.range((Excluded(txn_id), Unbounded)).map(|(_, r)| r)
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.queue.contains_key(&txn_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn release(&self, mut request: LockRequest) -> LockRequest {
        if let Some(callback) = request.on_release.take() {
            // The requester may have stopped caring; that is not our problem.
            let _ = callback.send(self.partition);
        }
        request
    }
}

/// Interface of the (external) global lock-queue manager: the executor
/// reports terminal outcomes so the manager can advance its global order.
pub trait LockQueueNotifier: Send + Sync {
    fn lock_queue_finished(&self, txn_id: TxnId, status: Status, partition: PartitionId);
}

/// Single-site deployments have no global manager to notify.
pub struct NoopLockQueueNotifier;

impl LockQueueNotifier for NoopLockQueueNotifier {
    fn lock_queue_finished(&self, _txn_id: TxnId, _status: Status, _partition: PartitionId) {}
}
