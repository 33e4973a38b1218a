// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! The fragment dispatcher. Splits one statement batch into
//! local-partition, same-site-peer, and remote-site work, ships the latter
//! two, and collects dependencies as they return. The executor owns the
//! blocking wait so it can interleave utility work between polls.

use crate::{
    coordinator::{Coordinator, WorkRequest},
    error::ExecutorError,
    message::InternalMessage,
    work_queue::WorkQueueSender,
};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use itertools::Itertools;
use kiln_logger::prelude::*;
use kiln_storage_interface::DependencySet;
use kiln_types::{
    message::{WorkFragment, WorkResult},
    transaction::TransactionState,
    DependencyId, PartitionId, SiteId, Status, TransactionError,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

/// Where one fragment executes, relative to this partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Destination {
    Local,
    Peer(PartitionId),
    RemoteSite(SiteId),
}

pub struct FragmentDispatcher {
    partition_id: PartitionId,
    site_id: SiteId,
    partitions_per_site: u32,
    peers: HashMap<PartitionId, WorkQueueSender>,
    coordinator: Arc<dyn Coordinator>,
    result_tx: Sender<WorkResult>,
    result_rx: Receiver<WorkResult>,
    response_timeout_ms: u64,
}

impl FragmentDispatcher {
    pub fn new(
        partition_id: PartitionId,
        partitions_per_site: u32,
        peers: HashMap<PartitionId, WorkQueueSender>,
        coordinator: Arc<dyn Coordinator>,
        response_timeout_ms: u64,
    ) -> Self {
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        Self {
            partition_id,
            site_id: partition_id / partitions_per_site.max(1),
            partitions_per_site: partitions_per_site.max(1),
            peers,
            coordinator,
            result_tx,
            result_rx,
            response_timeout_ms,
        }
    }

    pub fn site_of(&self, partition: PartitionId) -> SiteId {
        partition / self.partitions_per_site
    }

    pub fn classify(&self, partition: PartitionId) -> Destination {
        if partition == self.partition_id {
            Destination::Local
        } else if self.site_of(partition) == self.site_id {
            Destination::Peer(partition)
        } else {
            Destination::RemoteSite(self.site_of(partition))
        }
    }

    /// Ships every non-local fragment of a batch: peers get one message per
    /// fragment, remote sites one batched work request each. Prefetched
    /// results satisfy fragments without any send.
    pub fn dispatch(
        &self,
        txn: &mut TransactionState,
        procedure: &str,
        params: &[Bytes],
        fragments: Vec<WorkFragment>,
    ) -> Result<PendingBatch, ExecutorError> {
        // A previous round may have timed out with results still in flight;
        // they must not satisfy this round's dependencies.
        while let Ok(stale) = self.result_rx.try_recv() {
            warn!(
                partition = self.partition_id,
                from = stale.partition_id,
                "dropping stale work result"
            );
        }

        let mut pending = PendingBatch::new(self.result_rx.clone(), self.response_timeout_ms);

        let mut to_send = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let key = fragment.prefetch_key(params);
            match txn.prefetch_results.remove(&key) {
                Some(rows) => {
                    trace!(
                        partition = self.partition_id,
                        txn_id = txn.id,
                        "prefetch hit, skipping remote send"
                    );
                    for (dep_id, data) in fragment.output_dep_ids.iter().zip(rows) {
                        pending.collected.insert(*dep_id, data);
                    }
                },
                None => {
                    pending.expected.extend(fragment.output_dep_ids.iter().copied());
                    to_send.push(fragment);
                },
            }
        }

        for fragment in &to_send {
            if let Destination::Peer(partition) = self.classify(fragment.partition_id) {
                let sender = self.peers.get(&partition).ok_or_else(|| {
                    ExecutorError::Invariant(format!("no peer executor for partition {}", partition))
                })?;
                sender.send(InternalMessage::WorkFragment {
                    txn_id: txn.id,
                    base_partition: txn.base_partition,
                    procedure: procedure.to_string(),
                    params: params.to_vec(),
                    fragment: fragment.clone(),
                    reply: self.result_tx.clone(),
                })?;
            }
        }

        let mut remote = to_send
            .into_iter()
            .filter(|f| matches!(self.classify(f.partition_id), Destination::RemoteSite(_)))
            .collect::<Vec<_>>();
        remote.sort_by_key(|f| self.site_of(f.partition_id));
        let by_site = remote.into_iter().chunk_by(|f| self.site_of(f.partition_id));
        for (site, site_fragments) in &by_site {
            self.coordinator.transaction_work(
                WorkRequest {
                    txn_id: txn.id,
                    base_partition: txn.base_partition,
                    procedure: procedure.to_string(),
                    fragments: site_fragments.collect(),
                    params: params.to_vec(),
                },
                site,
                self.result_tx.clone(),
            );
        }

        Ok(pending)
    }

    /// The channel remote results for this partition arrive on; handed to
    /// peers when the executor itself serves remote work.
    pub fn result_sender(&self) -> Sender<WorkResult> {
        self.result_tx.clone()
    }
}

/// The count-down latch for one dispatched round: dependencies still owed,
/// results already collected, and the failure that ends the round early.
#[derive(Debug)]
pub struct PendingBatch {
    rx: Receiver<WorkResult>,
    expected: HashSet<DependencyId>,
    collected: DependencySet,
    failure: Option<TransactionError>,
    deadline: Instant,
    timeout_ms: u64,
}

impl PendingBatch {
    fn new(rx: Receiver<WorkResult>, timeout_ms: u64) -> Self {
        Self {
            rx,
            expected: HashSet::new(),
            collected: DependencySet::new(),
            failure: None,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            timeout_ms,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.failure.is_some() || self.expected.is_empty()
    }

    pub fn missing(&self) -> usize {
        self.expected.len()
    }

    /// Waits up to `timeout` for one result. Returns true once the round is
    /// complete (all dependencies in, or a fragment failed). Exceeding the
    /// round deadline is fatal: the cluster is presumed unhealthy.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool, ExecutorError> {
        if self.is_ready() {
            return Ok(true);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => self.absorb(result),
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => return Err(ExecutorError::QueueDisconnected),
        }
        if !self.is_ready() && Instant::now() >= self.deadline {
            return Err(ExecutorError::ResponseTimeout {
                timeout_ms: self.timeout_ms,
                missing: self.expected.len(),
            });
        }
        Ok(self.is_ready())
    }

    pub fn into_result(self) -> Result<DependencySet, TransactionError> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(self.collected),
        }
    }

    fn absorb(&mut self, result: WorkResult) {
        if result.status.is_abort() {
            self.failure = Some(error_from_result(&result));
            return;
        }
        for (dep_id, data) in result.dep_ids.iter().zip(result.dep_data) {
            if self.expected.remove(dep_id) {
                self.collected.insert(*dep_id, data);
            } else {
                warn!(
                    dep_id = dep_id,
                    from = result.partition_id,
                    "unexpected dependency in work result"
                );
            }
        }
    }
}

fn error_from_result(result: &WorkResult) -> TransactionError {
    let message = result.error.clone().unwrap_or_default();
    match result.status {
        Status::AbortUser => TransactionError::User(message),
        Status::AbortMispredict => TransactionError::Mispredict {
            touched: vec![result.partition_id],
        },
        Status::AbortSpeculative => TransactionError::Speculative,
        Status::AbortEvictedAccess => TransactionError::EvictedAccess { table: message },
        Status::AbortReject => TransactionError::Reject,
        Status::Ok | Status::AbortUnexpected => TransactionError::Unexpected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_queue::new_work_queue;
    use claims::{assert_err, assert_ok};
    use futures::channel::oneshot;
    use kiln_infallible::Mutex;
    use kiln_types::TxnId;

    #[derive(Default)]
    struct RecordingCoordinator {
        work: Mutex<Vec<(SiteId, Vec<WorkFragment>)>>,
    }

    impl Coordinator for RecordingCoordinator {
        fn transaction_work(
            &self,
            request: WorkRequest,
            target_site: SiteId,
            _reply: Sender<WorkResult>,
        ) {
            self.work.lock().push((target_site, request.fragments));
        }

        fn transaction_prepare(
            &self,
            _txn_id: TxnId,
            _callback: oneshot::Sender<Status>,
            _partitions: Vec<PartitionId>,
        ) {
        }

        fn transaction_finish(&self, _txn_id: TxnId, _status: Status, _partitions: Vec<PartitionId>) {}

        fn transaction_prefetch_result(&self, _txn_id: TxnId, _result: WorkResult) {}

        fn crash_cluster(&self, _partition: PartitionId, _reason: String) {}
    }

    fn fragment(partition_id: PartitionId, output_dep_ids: Vec<DependencyId>) -> WorkFragment {
        WorkFragment {
            partition_id,
            fragment_ids: vec![1],
            param_indices: vec![0],
            input_dep_ids: vec![],
            output_dep_ids,
            read_only: false,
            last_fragment: false,
            prefetch: false,
            needs_input: false,
            future_statements: vec![],
        }
    }

    fn dispatcher(
        coordinator: Arc<RecordingCoordinator>,
    ) -> (FragmentDispatcher, crate::work_queue::WorkQueue) {
        let (peer_tx, peer_rx) = new_work_queue();
        let mut peers = HashMap::new();
        peers.insert(1, peer_tx);
        (
            FragmentDispatcher::new(0, 2, peers, coordinator, 50),
            peer_rx,
        )
    }

    #[test]
    fn test_classification() {
        let (dispatcher, _peer_rx) = dispatcher(Arc::new(RecordingCoordinator::default()));
        assert_eq!(dispatcher.classify(0), Destination::Local);
        assert_eq!(dispatcher.classify(1), Destination::Peer(1));
        assert_eq!(dispatcher.classify(5), Destination::RemoteSite(2));
    }

    #[test]
    fn test_dispatch_routes_and_collects() {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let (dispatcher, peer_rx) = dispatcher(coordinator.clone());
        let mut txn = TransactionState::new_remote_handle(7, 0, "Pay".to_string(), Bytes::new());

        let mut pending = assert_ok!(dispatcher.dispatch(
            &mut txn,
            "Pay",
            &[Bytes::from_static(b"p")],
            vec![fragment(1, vec![10]), fragment(4, vec![20])],
        ));
        assert_eq!(pending.missing(), 2);

        // Peer fragment went to partition 1's queue.
        let peer_msg = peer_rx.try_poll().unwrap();
        let reply = match peer_msg {
            InternalMessage::WorkFragment { reply, fragment, .. } => {
                assert_eq!(fragment.partition_id, 1);
                reply
            },
            other => panic!("unexpected message {:?}", other),
        };
        // Remote-site fragment went through the coordinator to site 2.
        assert_eq!(coordinator.work.lock()[0].0, 2);

        // Feed results back through both paths.
        reply
            .send(WorkResult {
                partition_id: 1,
                status: Status::Ok,
                dep_ids: vec![10],
                dep_data: vec![Bytes::from_static(b"a")],
                error: None,
            })
            .unwrap();
        assert!(!assert_ok!(pending.poll(Duration::from_millis(10))));
        assert_eq!(pending.missing(), 1);

        dispatcher
            .result_sender()
            .send(WorkResult {
                partition_id: 4,
                status: Status::Ok,
                dep_ids: vec![20],
                dep_data: vec![Bytes::from_static(b"b")],
                error: None,
            })
            .unwrap();
        while !assert_ok!(pending.poll(Duration::from_millis(10))) {}
        let deps = pending.into_result().unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[&10], Bytes::from_static(b"a"));
    }

    #[test]
    fn test_prefetch_hit_skips_send() {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let (dispatcher, _peer_rx) = dispatcher(coordinator.clone());
        let mut txn = TransactionState::new_remote_handle(7, 0, "Pay".to_string(), Bytes::new());

        let fragment = fragment(4, vec![20]);
        let params = [Bytes::from_static(b"p")];
        txn.prefetch_results.insert(
            fragment.prefetch_key(&params),
            vec![Bytes::from_static(b"cached")],
        );

        let pending =
            assert_ok!(dispatcher.dispatch(&mut txn, "Pay", &params, vec![fragment]));
        assert!(pending.is_ready());
        assert!(coordinator.work.lock().is_empty());
        assert_eq!(
            pending.into_result().unwrap()[&20],
            Bytes::from_static(b"cached")
        );
    }

    #[test]
    fn test_abort_result_ends_round() {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let (dispatcher, _peer_rx) = dispatcher(coordinator);
        let mut txn = TransactionState::new_remote_handle(7, 0, "Pay".to_string(), Bytes::new());

        let mut pending = assert_ok!(dispatcher.dispatch(
            &mut txn,
            "Pay",
            &[],
            vec![fragment(4, vec![20])],
        ));
        dispatcher
            .result_sender()
            .send(WorkResult::error(
                4,
                Status::AbortUser,
                "no such account".to_string(),
            ))
            .unwrap();
        while !assert_ok!(pending.poll(Duration::from_millis(10))) {}
        assert_eq!(
            pending.into_result().unwrap_err(),
            TransactionError::User("no such account".to_string())
        );
    }

    #[test]
    fn test_response_timeout_is_fatal() {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let (dispatcher, _peer_rx) = dispatcher(coordinator);
        let mut txn = TransactionState::new_remote_handle(7, 0, "Pay".to_string(), Bytes::new());

        let mut pending = assert_ok!(dispatcher.dispatch(
            &mut txn,
            "Pay",
            &[],
            vec![fragment(4, vec![20])],
        ));
        std::thread::sleep(Duration::from_millis(60));
        let err = assert_err!(pending.poll(Duration::from_millis(1)));
        assert!(matches!(err, ExecutorError::ResponseTimeout { .. }));
    }
}
