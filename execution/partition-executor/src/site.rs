// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Site wiring: spawns one executor thread per hosted partition, hands every
//! executor the work-queue senders of its peers, and exposes the enqueue
//! surface peers and the coordinator use.

use crate::{
    coordinator::Coordinator,
    error::ExecutorError,
    executor::PartitionExecutor,
    lock_queue::{LockQueueNotifier, NoopLockQueueNotifier},
    message::{InternalMessage, WorkResultSender},
    procedures::ProcedureRunner,
    work_queue::{new_work_queue, WorkQueueSender},
};
use bytes::Bytes;
use futures::channel::oneshot;
use kiln_config::SiteConfig;
use kiln_infallible::duration_since_epoch;
use kiln_logger::prelude::*;
use kiln_storage_interface::StorageEngine;
use kiln_types::{
    message::WorkFragment,
    procedure::ProcedureCatalog,
    transaction::{ClientResponse, NewTransactionRequest},
    PartitionId, Status, TxnId,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

/// Site-wide monotonic transaction id assignment. Ids double as global
/// sequence numbers in the lock queues.
#[derive(Debug)]
pub struct TxnIdGenerator {
    next: AtomicU64,
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TxnIdGenerator {
    pub fn new(first: TxnId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> TxnId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct SiteBuilder {
    config: SiteConfig,
    catalog: Arc<ProcedureCatalog>,
    coordinator: Arc<dyn Coordinator>,
    lock_notifier: Arc<dyn LockQueueNotifier>,
    runners: HashMap<String, Arc<dyn ProcedureRunner>>,
    engines: HashMap<PartitionId, Box<dyn StorageEngine>>,
    engine_catalog: Vec<u8>,
    txn_ids: Arc<TxnIdGenerator>,
}

impl SiteBuilder {
    pub fn new(
        config: SiteConfig,
        catalog: Arc<ProcedureCatalog>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            config,
            catalog,
            coordinator,
            lock_notifier: Arc::new(NoopLockQueueNotifier),
            runners: HashMap::new(),
            engines: HashMap::new(),
            engine_catalog: Vec::new(),
            txn_ids: Arc::new(TxnIdGenerator::default()),
        }
    }

    /// Serialized storage catalog loaded into every engine before its
    /// executor starts.
    pub fn with_engine_catalog(mut self, catalog: Vec<u8>) -> Self {
        self.engine_catalog = catalog;
        self
    }

    pub fn with_lock_notifier(mut self, notifier: Arc<dyn LockQueueNotifier>) -> Self {
        self.lock_notifier = notifier;
        self
    }

    pub fn with_txn_id_generator(mut self, txn_ids: Arc<TxnIdGenerator>) -> Self {
        self.txn_ids = txn_ids;
        self
    }

    pub fn register_runner(
        mut self,
        procedure: impl Into<String>,
        runner: Arc<dyn ProcedureRunner>,
    ) -> Self {
        self.runners.insert(procedure.into(), runner);
        self
    }

    pub fn register_engine(mut self, partition: PartitionId, engine: Box<dyn StorageEngine>) -> Self {
        self.engines.insert(partition, engine);
        self
    }

    /// Spawns every partition executor on its own named thread.
    pub fn start(mut self) -> Result<ExecutorSite, ExecutorError> {
        let shutdown = Arc::new(AtomicBool::new(false));

        // Create every channel first so each executor starts with the full
        // peer map.
        let mut channels = HashMap::new();
        for partition in &self.config.partitions {
            channels.insert(*partition, new_work_queue());
        }
        let senders: HashMap<PartitionId, WorkQueueSender> = channels
            .iter()
            .map(|(p, (tx, _))| (*p, tx.clone()))
            .collect();

        let mut threads = Vec::with_capacity(self.config.partitions.len());
        for partition in self.config.partitions.clone() {
            let mut engine = self.engines.remove(&partition).ok_or_else(|| {
                ExecutorError::Invariant(format!("no storage engine for partition {}", partition))
            })?;
            engine.load_catalog(&self.engine_catalog)?;
            let channel = channels.remove(&partition).expect("channel created above");
            let mut peers = senders.clone();
            peers.remove(&partition);

            let (mut executor, _) = PartitionExecutor::new(
                partition,
                self.config.partitions_per_site,
                self.config.executor.clone(),
                engine,
                self.catalog.clone(),
                self.runners.clone(),
                peers,
                self.coordinator.clone(),
                self.lock_notifier.clone(),
                self.txn_ids.clone(),
                shutdown.clone(),
                Some(channel),
            );
            let handle = thread::Builder::new()
                .name(format!("part-exec-{}", partition))
                .spawn(move || executor.run())
                .map_err(|e| {
                    ExecutorError::Invariant(format!("failed to spawn executor thread: {}", e))
                })?;
            threads.push(handle);
        }

        info!(
            site = self.config.site_id,
            partitions = self.config.partitions.len(),
            "executor site started"
        );
        Ok(ExecutorSite {
            config: self.config,
            senders,
            threads,
            shutdown,
            txn_ids: self.txn_ids,
        })
    }
}

pub struct ExecutorSite {
    config: SiteConfig,
    senders: HashMap<PartitionId, WorkQueueSender>,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    txn_ids: Arc<TxnIdGenerator>,
}

impl ExecutorSite {
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn txn_ids(&self) -> &Arc<TxnIdGenerator> {
        &self.txn_ids
    }

    pub fn sender(&self, partition: PartitionId) -> Option<&WorkQueueSender> {
        self.senders.get(&partition)
    }

    fn send(&self, partition: PartitionId, msg: InternalMessage) -> Result<(), ExecutorError> {
        self.senders
            .get(&partition)
            .ok_or_else(|| {
                ExecutorError::Invariant(format!("partition {} not hosted here", partition))
            })?
            .send(msg)
    }

    /// Client entry point: hands a raw invocation to its base partition and
    /// returns the response channel.
    pub fn queue_new_transaction(
        &self,
        procedure: impl Into<String>,
        params: Bytes,
        base_partition: PartitionId,
        predicted_partitions: BTreeSet<PartitionId>,
        predicted_read_only: bool,
    ) -> Result<oneshot::Receiver<ClientResponse>, ExecutorError> {
        let (client, response) = oneshot::channel();
        let request = NewTransactionRequest {
            procedure: procedure.into(),
            params,
            base_partition,
            predicted_partitions,
            predicted_read_only,
            initiate_time_us: duration_since_epoch().as_micros() as u64,
            client,
        };
        self.send(base_partition, InternalMessage::InitializeRequest { request })?;
        Ok(response)
    }

    pub fn queue_start_transaction(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
    ) -> Result<(), ExecutorError> {
        self.send(partition, InternalMessage::StartTxn { txn_id })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn queue_work(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: impl Into<String>,
        params: Vec<Bytes>,
        fragment: WorkFragment,
        reply: WorkResultSender,
    ) -> Result<(), ExecutorError> {
        self.send(partition, InternalMessage::WorkFragment {
            txn_id,
            base_partition,
            procedure: procedure.into(),
            params,
            fragment,
            reply,
        })
    }

    pub fn queue_prepare(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
    ) -> Result<oneshot::Receiver<PartitionId>, ExecutorError> {
        let (callback, acked) = oneshot::channel();
        self.send(partition, InternalMessage::Prepare {
            txn_id,
            callback: Some(callback),
        })?;
        Ok(acked)
    }

    pub fn queue_finish(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        status: Status,
    ) -> Result<(), ExecutorError> {
        self.send(partition, InternalMessage::Finish { txn_id, status })
    }

    /// Requests the partition lock for a remote distributed transaction. The
    /// returned channel resolves when the lock is granted.
    pub fn queue_set_partition_lock(
        &self,
        partition: PartitionId,
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: impl Into<String>,
        params: Bytes,
    ) -> Result<oneshot::Receiver<PartitionId>, ExecutorError> {
        let (released, granted) = oneshot::channel();
        self.send(partition, InternalMessage::SetDistributedTxn {
            txn_id,
            base_partition,
            procedure: procedure.into(),
            params,
            released: Some(released),
        })?;
        Ok(granted)
    }

    /// Stops every executor and joins the threads.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake any executor parked in a queue poll.
        for sender in self.senders.values() {
            let _ = sender.send(InternalMessage::UtilityWork);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("executor thread panicked during shutdown");
            }
        }
    }
}
