// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Harness for partition-executor integration tests: a recording coordinator
//! that drives two-phase commit over real work queues, mock storage engines,
//! and a handful of table-typed stored procedures.

// Not every test binary uses every helper.
#![allow(dead_code)]

use bytes::Bytes;
use futures::channel::oneshot;
use kiln_infallible::Mutex;
use kiln_partition_executor::{
    coordinator::{Coordinator, WorkRequest},
    message::{InternalMessage, WorkResultSender},
    procedures::{HaltProcedure, ProcedureContext, ProcedureRunner},
    site::{ExecutorSite, SiteBuilder, TxnIdGenerator},
    work_queue::WorkQueueSender,
};
use kiln_storage_interface::mock::{MockEngine, MockEngineHandle};
use kiln_types::{
    message::{BatchPlan, WorkFragment, WorkResult},
    procedure::{ProcedureCatalog, ProcedureDescriptor},
    transaction::ClientResponse,
    FragmentId, PartitionId, SiteId, Status, TransactionError, TxnId,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

pub const READ_A_FRAGMENT: FragmentId = 1;
pub const WRITE_A_FRAGMENT: FragmentId = 2;
pub const READ_B_FRAGMENT: FragmentId = 3;
pub const WRITE_B_FRAGMENT: FragmentId = 4;
pub const TRANSFER_FRAGMENT: FragmentId = 5;

/// Coordinator double: records remote work (optionally holding it until the
/// test releases it) and drives two-phase commit with real messages.
pub struct TestCoordinator {
    senders: Mutex<HashMap<PartitionId, WorkQueueSender>>,
    hold_remote: AtomicBool,
    held: Mutex<Vec<(WorkRequest, WorkResultSender)>>,
    prefetches: Mutex<Vec<(TxnId, WorkResult)>>,
    crashes: Mutex<Vec<(PartitionId, String)>>,
}

impl TestCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(HashMap::new()),
            hold_remote: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            prefetches: Mutex::new(Vec::new()),
            crashes: Mutex::new(Vec::new()),
        })
    }

    pub fn connect(&self, site: &ExecutorSite) {
        let mut senders = self.senders.lock();
        for partition in &site.config().partitions {
            if let Some(sender) = site.sender(*partition) {
                senders.insert(*partition, sender.clone());
            }
        }
    }

    /// Queue remote-site work instead of answering it immediately.
    pub fn hold_remote_work(&self) {
        self.hold_remote.store(true, Ordering::Release);
    }

    pub fn held_work_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Answers every held work request with per-fragment OK results.
    pub fn release_remote_work(&self) {
        for (request, reply) in self.held.lock().drain(..) {
            respond_ok(&request, &reply);
        }
    }

    pub fn crash_count(&self) -> usize {
        self.crashes.lock().len()
    }

    pub fn prefetch_count(&self) -> usize {
        self.prefetches.lock().len()
    }
}

fn respond_ok(request: &WorkRequest, reply: &WorkResultSender) {
    for fragment in &request.fragments {
        let _ = reply.send(WorkResult {
            partition_id: fragment.partition_id,
            status: Status::Ok,
            dep_ids: fragment.output_dep_ids.clone(),
            dep_data: fragment
                .output_dep_ids
                .iter()
                .map(|id| Bytes::from(id.to_le_bytes().to_vec()))
                .collect(),
            error: None,
        });
    }
}

impl Coordinator for TestCoordinator {
    fn transaction_work(&self, request: WorkRequest, _target_site: SiteId, reply: WorkResultSender) {
        if self.hold_remote.load(Ordering::Acquire) {
            self.held.lock().push((request, reply));
        } else {
            respond_ok(&request, &reply);
        }
    }

    fn transaction_prepare(
        &self,
        txn_id: TxnId,
        callback: oneshot::Sender<Status>,
        partitions: Vec<PartitionId>,
    ) {
        // Drive 2PC off-thread: prepare every reachable partition, collect
        // the acks, then broadcast the commit.
        let senders: Vec<(PartitionId, WorkQueueSender)> = {
            let map = self.senders.lock();
            partitions
                .iter()
                .filter_map(|p| map.get(p).map(|s| (*p, s.clone())))
                .collect()
        };
        thread::spawn(move || {
            let mut acks = Vec::new();
            for (_, sender) in &senders {
                let (ack_tx, ack_rx) = oneshot::channel();
                if sender
                    .send(InternalMessage::Prepare {
                        txn_id,
                        callback: Some(ack_tx),
                    })
                    .is_ok()
                {
                    acks.push(ack_rx);
                }
            }
            for ack in acks {
                let _ = futures::executor::block_on(ack);
            }
            for (_, sender) in &senders {
                let _ = sender.send(InternalMessage::Finish {
                    txn_id,
                    status: Status::Ok,
                });
            }
            let _ = callback.send(Status::Ok);
        });
    }

    fn transaction_finish(&self, txn_id: TxnId, status: Status, partitions: Vec<PartitionId>) {
        let map = self.senders.lock();
        for partition in partitions {
            if let Some(sender) = map.get(&partition) {
                let _ = sender.send(InternalMessage::Finish { txn_id, status });
            }
        }
    }

    fn transaction_prefetch_result(&self, txn_id: TxnId, result: WorkResult) {
        self.prefetches.lock().push((txn_id, result));
    }

    fn crash_cluster(&self, partition: PartitionId, reason: String) {
        eprintln!("cluster crash requested by partition {}: {}", partition, reason);
        self.crashes.lock().push((partition, reason));
    }
}

// ----------------------------------------------------------------------
// Stored procedures

fn fragment(
    partition_id: PartitionId,
    fragment_id: FragmentId,
    read_only: bool,
    last_fragment: bool,
) -> WorkFragment {
    WorkFragment {
        partition_id,
        fragment_ids: vec![fragment_id],
        param_indices: vec![],
        input_dep_ids: vec![],
        output_dep_ids: vec![100 + partition_id],
        read_only,
        last_fragment,
        prefetch: false,
        needs_input: false,
        future_statements: vec![],
    }
}

pub fn local_plan(partition: PartitionId, fragment_id: FragmentId, read_only: bool) -> BatchPlan {
    BatchPlan {
        fragments: vec![fragment(partition, fragment_id, read_only, true)],
        params: vec![],
    }
}

/// One local statement batch; the procedure's whole result is its first
/// output dependency.
pub struct SingleFragmentProc {
    pub fragment_id: FragmentId,
    pub read_only: bool,
}

impl ProcedureRunner for SingleFragmentProc {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        let partition = ctx.partition_id();
        let deps = ctx.execute_batch(local_plan(partition, self.fragment_id, self.read_only))?;
        Ok(deps.into_values().next().unwrap_or_default())
    }
}

/// Writes, then aborts voluntarily; exercises rollback of logged work.
pub struct UserAbortProc;

impl ProcedureRunner for UserAbortProc {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        let partition = ctx.partition_id();
        ctx.execute_batch(local_plan(partition, WRITE_A_FRAGMENT, false))?;
        Err(TransactionError::User("insufficient funds".to_string()))
    }
}

/// Two-round dataflow: a peer fragment produces a dependency that a local
/// aggregation fragment consumes.
pub struct GatherProc;

impl ProcedureRunner for GatherProc {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        let local = ctx.partition_id();
        let peer: PartitionId = bcs::from_bytes(&ctx.params())
            .map_err(|e| TransactionError::Unexpected(format!("bad gather params: {}", e)))?;
        let plan = BatchPlan {
            fragments: vec![
                WorkFragment {
                    partition_id: peer,
                    fragment_ids: vec![READ_B_FRAGMENT],
                    param_indices: vec![],
                    input_dep_ids: vec![],
                    output_dep_ids: vec![50],
                    read_only: true,
                    last_fragment: true,
                    prefetch: false,
                    needs_input: false,
                    future_statements: vec![],
                },
                WorkFragment {
                    partition_id: local,
                    fragment_ids: vec![READ_A_FRAGMENT],
                    param_indices: vec![],
                    input_dep_ids: vec![50],
                    output_dep_ids: vec![51],
                    read_only: true,
                    last_fragment: true,
                    prefetch: false,
                    needs_input: true,
                    future_statements: vec![],
                },
            ],
            params: vec![],
        };
        let deps = ctx.execute_batch(plan)?;
        Ok(deps.get(&51).cloned().unwrap_or_default())
    }
}

/// Loader sysproc: bulk-loads its parameter blob into table `a`.
pub struct LoadSeedProc;

impl ProcedureRunner for LoadSeedProc {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        let rows = ctx.params();
        ctx.load_table("a", rows, false)?;
        Ok(Bytes::new())
    }
}

/// Multi-partition transfer: one write fragment per partition named in the
/// (bcs-encoded) parameter list.
pub struct TransferProc;

impl ProcedureRunner for TransferProc {
    fn run(&self, ctx: &mut ProcedureContext<'_>) -> Result<Bytes, TransactionError> {
        let partitions: Vec<PartitionId> = bcs::from_bytes(&ctx.params())
            .map_err(|e| TransactionError::Unexpected(format!("bad transfer params: {}", e)))?;
        let plan = BatchPlan {
            fragments: partitions
                .iter()
                .map(|p| fragment(*p, TRANSFER_FRAGMENT, false, true))
                .collect(),
            params: vec![],
        };
        let deps = ctx.execute_batch(plan)?;
        Ok(Bytes::from(deps.len().to_le_bytes().to_vec()))
    }
}

pub fn transfer_params(partitions: &[PartitionId]) -> Bytes {
    Bytes::from(bcs::to_bytes(&partitions.to_vec()).expect("serializing partition list"))
}

pub fn test_catalog() -> Arc<ProcedureCatalog> {
    Arc::new(ProcedureCatalog::new([
        ProcedureDescriptor::new("ReadA").read_only().reads(["a"]),
        ProcedureDescriptor::new("WriteA").reads(["a"]).writes(["a"]),
        ProcedureDescriptor::new("ReadB").read_only().reads(["b"]),
        ProcedureDescriptor::new("WriteB").reads(["b"]).writes(["b"]),
        ProcedureDescriptor::new("AbortA").writes(["a"]),
        ProcedureDescriptor::new("Transfer").reads(["t"]).writes(["t"]),
        ProcedureDescriptor::new("Gather").read_only().reads(["a", "b"]),
        ProcedureDescriptor::new("@Halt").sysproc(),
        ProcedureDescriptor::new("@LoadSeed").sysproc().writes(["a"]),
    ]))
}

// ----------------------------------------------------------------------
// Site harness

pub struct TestSite {
    pub site: ExecutorSite,
    pub coordinator: Arc<TestCoordinator>,
    pub engines: HashMap<PartitionId, MockEngineHandle>,
}

pub fn start_site(partitions: Vec<PartitionId>, partitions_per_site: u32) -> TestSite {
    start_site_with_ids(partitions, partitions_per_site, 1)
}

pub fn start_site_with_ids(
    partitions: Vec<PartitionId>,
    partitions_per_site: u32,
    first_txn_id: TxnId,
) -> TestSite {
    start_site_with_config(
        partitions,
        partitions_per_site,
        first_txn_id,
        kiln_config::ExecutorConfig::default(),
    )
}

pub fn start_site_with_config(
    partitions: Vec<PartitionId>,
    partitions_per_site: u32,
    first_txn_id: TxnId,
    executor: kiln_config::ExecutorConfig,
) -> TestSite {
    let coordinator = TestCoordinator::new();
    let mut builder = SiteBuilder::new(
        kiln_config::SiteConfig {
            site_id: partitions[0] / partitions_per_site,
            partitions_per_site,
            partitions: partitions.clone(),
            executor,
        },
        test_catalog(),
        coordinator.clone(),
    )
    .with_txn_id_generator(Arc::new(TxnIdGenerator::new(first_txn_id)))
    .register_runner("ReadA", Arc::new(SingleFragmentProc {
        fragment_id: READ_A_FRAGMENT,
        read_only: true,
    }))
    .register_runner("WriteA", Arc::new(SingleFragmentProc {
        fragment_id: WRITE_A_FRAGMENT,
        read_only: false,
    }))
    .register_runner("ReadB", Arc::new(SingleFragmentProc {
        fragment_id: READ_B_FRAGMENT,
        read_only: true,
    }))
    .register_runner("WriteB", Arc::new(SingleFragmentProc {
        fragment_id: WRITE_B_FRAGMENT,
        read_only: false,
    }))
    .register_runner("AbortA", Arc::new(UserAbortProc))
    .register_runner("Transfer", Arc::new(TransferProc))
    .register_runner("Gather", Arc::new(GatherProc))
    .register_runner("@Halt", Arc::new(HaltProcedure))
    .register_runner("@LoadSeed", Arc::new(LoadSeedProc));

    let mut engines = HashMap::new();
    for partition in &partitions {
        let engine = MockEngine::new();
        engines.insert(*partition, engine.handle());
        builder = builder.register_engine(*partition, Box::new(engine));
    }

    let site = builder.start().expect("site starts");
    coordinator.connect(&site);
    TestSite {
        site,
        coordinator,
        engines,
    }
}

impl TestSite {
    pub fn submit(
        &self,
        procedure: &str,
        params: Bytes,
        base_partition: PartitionId,
        predicted: &[PartitionId],
        read_only: bool,
    ) -> oneshot::Receiver<ClientResponse> {
        self.site
            .queue_new_transaction(
                procedure,
                params,
                base_partition,
                predicted.iter().copied().collect::<BTreeSet<_>>(),
                read_only,
            )
            .expect("enqueue transaction")
    }

    pub fn engine(&self, partition: PartitionId) -> &MockEngineHandle {
        &self.engines[&partition]
    }
}

// ----------------------------------------------------------------------
// Waiting helpers

pub fn recv_response(
    mut rx: oneshot::Receiver<ClientResponse>,
    timeout: Duration,
) -> ClientResponse {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(Some(response)) => return response,
            Ok(None) => {
                assert!(Instant::now() < deadline, "timed out waiting for response");
                thread::sleep(Duration::from_millis(1));
            },
            Err(_) => panic!("executor dropped the response channel"),
        }
    }
}

pub fn try_recv_response(rx: &mut oneshot::Receiver<ClientResponse>) -> Option<ClientResponse> {
    rx.try_recv().ok().flatten()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(1));
    }
}
