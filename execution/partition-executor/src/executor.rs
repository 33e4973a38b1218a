// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! The per-partition executor loop and the finish protocol that makes
//! speculative execution safe. One instance runs forever on one dedicated
//! thread and is the only owner of the partition's engine, queues, arena,
//! and undo counters.

use crate::{
    conflicts::{ConflictChecker, PessimisticConflictChecker, TableConflictChecker},
    coordinator::Coordinator,
    counters,
    dispatcher::FragmentDispatcher,
    error::ExecutorError,
    estimator::{ExecutionEstimator, MovingAverageEstimator},
    lock_queue::{LockQueue, LockQueueNotifier, LockRequest},
    message::InternalMessage,
    partition_state::{ExecMode, PartitionState},
    procedures::{ProcedureContext, ProcedureRunner},
    site::TxnIdGenerator,
    speculation::{compute_spec_type, SpeculativeScheduler},
    undo_token::{RoundKind, UndoTokenManager},
    work_queue::{new_work_queue, WorkQueue, WorkQueueSender},
};
use bytes::Bytes;
use futures::channel::oneshot;
use kiln_config::{ConflictCheckerKind, ExecutorConfig};
use kiln_infallible::duration_since_epoch;
use kiln_logger::prelude::*;
use kiln_metrics_core::IntGaugeHelper;
use kiln_storage_interface::{DependencySet, EngineError, StatsSelector, StorageEngine, WorkUnit};
use kiln_types::{
    is_real_undo_token,
    message::{BatchPlan, WorkFragment, WorkResult},
    procedure::ProcedureCatalog,
    transaction::{ClientResponse, NewTransactionRequest, SpecType, TransactionState},
    PartitionId, Status, TransactionError, TxnId, DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub struct PartitionExecutor {
    partition_id: PartitionId,
    config: ExecutorConfig,
    engine: Box<dyn StorageEngine>,
    work_queue: WorkQueue,
    self_sender: WorkQueueSender,
    lock_queue: LockQueue,
    state: PartitionState,
    undo: UndoTokenManager,
    scheduler: SpeculativeScheduler,
    dispatcher: FragmentDispatcher,
    arena: HashMap<TxnId, TransactionState>,
    /// Ids whose arena entries are gone but for which late messages must be
    /// refused rather than re-admitted. Pruned on tick.
    recently_finished: HashSet<TxnId>,
    runners: HashMap<String, Arc<dyn ProcedureRunner>>,
    catalog: Arc<ProcedureCatalog>,
    coordinator: Arc<dyn Coordinator>,
    lock_notifier: Arc<dyn LockQueueNotifier>,
    estimator: Arc<dyn ExecutionEstimator>,
    txn_ids: Arc<TxnIdGenerator>,
    shutdown: Arc<AtomicBool>,
    /// Fatal fault raised inside procedure execution, surfaced once the
    /// procedure unwinds back to the loop.
    pending_fatal: Option<ExecutorError>,
    /// Messages pulled off the queue during a dispatch latch that must wait
    /// for the running procedure to unwind (the current dtxn's own finish).
    stashed_messages: VecDeque<InternalMessage>,
    last_tick: Instant,
}

impl PartitionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition_id: PartitionId,
        partitions_per_site: u32,
        config: ExecutorConfig,
        engine: Box<dyn StorageEngine>,
        catalog: Arc<ProcedureCatalog>,
        runners: HashMap<String, Arc<dyn ProcedureRunner>>,
        peers: HashMap<PartitionId, WorkQueueSender>,
        coordinator: Arc<dyn Coordinator>,
        lock_notifier: Arc<dyn LockQueueNotifier>,
        txn_ids: Arc<TxnIdGenerator>,
        shutdown: Arc<AtomicBool>,
        channel: Option<(WorkQueueSender, WorkQueue)>,
    ) -> (Self, WorkQueueSender) {
        let (self_sender, work_queue) = channel.unwrap_or_else(new_work_queue);
        let estimator: Arc<dyn ExecutionEstimator> = Arc::new(MovingAverageEstimator::default());
        let checker: Box<dyn ConflictChecker> = match config.conflict_checker {
            ConflictCheckerKind::Table => Box::new(TableConflictChecker::new(catalog.clone())),
            ConflictCheckerKind::Pessimistic => Box::new(PessimisticConflictChecker),
        };
        let scheduler =
            SpeculativeScheduler::new(partition_id, &config, checker, estimator.clone());
        let dispatcher = FragmentDispatcher::new(
            partition_id,
            partitions_per_site,
            peers,
            coordinator.clone(),
            config.response_timeout_ms,
        );
        let executor = Self {
            partition_id,
            undo: UndoTokenManager::new(partition_id, config.force_undo_logging),
            config,
            engine,
            work_queue,
            self_sender: self_sender.clone(),
            lock_queue: LockQueue::new(partition_id),
            state: PartitionState::new(partition_id),
            scheduler,
            dispatcher,
            arena: HashMap::new(),
            recently_finished: HashSet::new(),
            runners,
            catalog,
            coordinator,
            lock_notifier,
            estimator,
            txn_ids,
            shutdown,
            pending_fatal: None,
            stashed_messages: VecDeque::new(),
            last_tick: Instant::now(),
        };
        (executor, self_sender)
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Runs until shutdown. Any unrecoverable fault crashes the cluster.
    pub fn run(&mut self) {
        info!(partition = self.partition_id, "partition executor started");
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.loop_once() {
                error!(
                    partition = self.partition_id,
                    error = ?e,
                    exec_mode = self.state.exec_mode().get_label(),
                    current_dtxn = ?self.state.current_dtxn(),
                    lock_queue_depth = self.lock_queue.len(),
                    blocked_responses = self.state.blocked_response_count(),
                    "unrecoverable executor fault"
                );
                self.shutdown.store(true, Ordering::Release);
                self.coordinator
                    .crash_cluster(self.partition_id, e.to_string());
            }
        }
        info!(partition = self.partition_id, "partition executor stopped");
    }

    /// One turn of the loop: lock-queue poll, one work message (or utility
    /// work), periodic tick.
    pub fn loop_once(&mut self) -> Result<(), ExecutorError> {
        if self.state.current_dtxn().is_none() {
            self.poll_lock_queue()?;
        }

        if let Some(msg) = self.stashed_messages.pop_front() {
            self.dispatch_message(msg)?;
        } else {
            let poll_timeout = Duration::from_micros(self.config.work_queue_poll_us);
            match self.work_queue.poll(poll_timeout)? {
                Some(msg) => self.dispatch_message(msg)?,
                None => self.utility_work()?,
            }
        }

        self.maybe_tick();
        Ok(())
    }

    fn poll_lock_queue(&mut self) -> Result<(), ExecutorError> {
        if self.state.exec_mode() == ExecMode::Disabled {
            return Ok(());
        }
        if let Some(request) = self.lock_queue.poll() {
            if request.single_partition {
                // Fast path: run it off the work queue in arrival order.
                self.self_sender.send(InternalMessage::StartTxn {
                    txn_id: request.txn_id,
                })?;
            } else {
                self.install_distributed_txn(request.txn_id, request.local)?;
            }
        }
        Ok(())
    }

    fn install_distributed_txn(&mut self, txn_id: TxnId, local: bool) -> Result<(), ExecutorError> {
        if !self.state.install_dtxn(txn_id) {
            return Err(ExecutorError::Invariant(format!(
                "lock queue released txn {} while another dtxn holds the partition",
                txn_id
            )));
        }
        if local {
            self.self_sender
                .send(InternalMessage::StartTxn { txn_id })?;
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: InternalMessage) -> Result<(), ExecutorError> {
        if self.should_block(&msg) {
            self.state.block_message(msg);
            return Ok(());
        }
        let txn_id = msg.txn_id();
        trace!(
            partition = self.partition_id,
            message = msg.get_label(),
            txn_id = ?txn_id,
            "dispatching work message"
        );
        match msg {
            InternalMessage::StartTxn { txn_id } => self.start_transaction(txn_id)?,
            InternalMessage::WorkFragment {
                txn_id,
                base_partition,
                procedure,
                params,
                fragment,
                reply,
            } => self.handle_work_fragment(txn_id, base_partition, procedure, params, fragment, reply)?,
            InternalMessage::Prepare { txn_id, callback } => self.handle_prepare(txn_id, callback),
            InternalMessage::Finish { txn_id, status } => self.handle_finish(txn_id, status)?,
            InternalMessage::InitializeRequest { request } => {
                self.handle_initialize_request(request)
            },
            InternalMessage::InitializeTxn { txn } => self.handle_initialize_txn(txn),
            InternalMessage::SetDistributedTxn {
                txn_id,
                base_partition,
                procedure,
                params,
                released,
            } => self.handle_set_distributed_txn(txn_id, base_partition, procedure, params, released),
            InternalMessage::DeferredQuery { txn_id, plan } => {
                self.handle_deferred_query(txn_id, plan)
            },
            InternalMessage::UtilityWork => {},
            InternalMessage::UpdateMemory => self.handle_update_memory(),
            InternalMessage::SnapshotWork => self.handle_snapshot_work(),
            InternalMessage::TableStatsRequest {
                selector,
                table_ids,
                callback,
            } => self.handle_table_stats(selector, table_ids, callback),
        }
        if let Some(txn_id) = txn_id {
            self.state.record_executed(txn_id);
        }
        Ok(())
    }

    /// Messages serialized behind the current dtxn or behind a
    /// speculation halt.
    fn should_block(&self, msg: &InternalMessage) -> bool {
        let mode = self.state.exec_mode();
        let current = self.state.current_dtxn();
        match msg {
            InternalMessage::WorkFragment { txn_id, .. }
            | InternalMessage::SetDistributedTxn { txn_id, .. } => {
                current.map_or(false, |c| c != *txn_id)
            },
            InternalMessage::StartTxn { txn_id } => {
                mode == ExecMode::Disabled && current != Some(*txn_id)
            },
            InternalMessage::InitializeRequest { .. }
            | InternalMessage::InitializeTxn { .. }
            | InternalMessage::DeferredQuery { .. } => mode == ExecMode::Disabled,
            InternalMessage::Prepare { .. }
            | InternalMessage::Finish { .. }
            | InternalMessage::UtilityWork
            | InternalMessage::UpdateMemory
            | InternalMessage::SnapshotWork
            | InternalMessage::TableStatsRequest { .. } => false,
        }
    }

    // ------------------------------------------------------------------
    // Transaction intake

    fn handle_initialize_request(&mut self, request: NewTransactionRequest) {
        let sysproc = self.catalog.is_sysproc(&request.procedure);
        if self.state.is_halted() && !sysproc {
            counters::TRANSACTIONS
                .with_label_values(&[Status::AbortReject.get_label()])
                .inc();
            let _ = request
                .client
                .send(ClientResponse::aborted(0, &TransactionError::Reject));
            return;
        }
        let txn_id = self.txn_ids.next_id();
        let txn = TransactionState::new(txn_id, request, sysproc);
        let single = txn.is_predicted_single_partition();
        debug!(
            partition = self.partition_id,
            txn_id = txn_id,
            procedure = %txn.procedure,
            single_partition = single,
            "initialized transaction"
        );
        self.arena.insert(txn_id, txn);
        self.lock_queue
            .insert(LockRequest::new(txn_id, single, true));
    }

    fn handle_initialize_txn(&mut self, txn: TransactionState) {
        let txn_id = txn.id;
        let single = txn.is_predicted_single_partition();
        self.arena.insert(txn_id, txn);
        self.lock_queue
            .insert(LockRequest::new(txn_id, single, true));
    }

    // ------------------------------------------------------------------
    // Local procedure execution

    fn start_transaction(&mut self, txn_id: TxnId) -> Result<(), ExecutorError> {
        let txn = match self.arena.get(&txn_id) {
            Some(txn) => txn,
            None => {
                warn!(
                    partition = self.partition_id,
                    txn_id = txn_id,
                    "start for unknown transaction"
                );
                return Ok(());
            },
        };
        if self.state.is_halted() && !txn.sysproc {
            self.reject_transaction(txn_id);
            return Ok(());
        }

        let speculative = match self.state.current_dtxn() {
            // A single-partition txn starting under an installed dtxn runs
            // speculatively, whether the scheduler picked it or it was
            // already sitting in the work queue.
            Some(dtxn_id) if dtxn_id != txn_id => {
                let dtxn = self.arena.get(&dtxn_id).ok_or_else(|| {
                    ExecutorError::Invariant(format!("current dtxn {} not in arena", dtxn_id))
                })?;
                Some(compute_spec_type(dtxn, self.partition_id))
            },
            _ => None,
        };
        self.run_local_transaction(txn_id, speculative)
    }

    fn run_local_transaction(
        &mut self,
        txn_id: TxnId,
        speculative: Option<SpecType>,
    ) -> Result<(), ExecutorError> {
        let (procedure, runner) = {
            let txn = match self.arena.get_mut(&txn_id) {
                Some(txn) => txn,
                None => return Ok(()),
            };
            txn.speculative_type = speculative;
            (txn.procedure.clone(), self.runners.get(&txn.procedure).cloned())
        };

        let result = match runner {
            Some(runner) => {
                let timer = counters::PROCEDURE_SECONDS
                    .with_label_values(&[procedure.as_str()])
                    .start_timer();
                let started = Instant::now();
                let result = runner.run(&mut ProcedureContext {
                    executor: self,
                    txn_id,
                });
                timer.observe_duration();
                self.estimator
                    .record(&procedure, started.elapsed().as_micros() as u64);
                result
            },
            None => Err(TransactionError::Unexpected(format!(
                "no runner registered for procedure {}",
                procedure
            ))),
        };

        // Fatal faults raised mid-procedure outrank the transaction outcome.
        if let Some(fatal) = self.pending_fatal.take() {
            return Err(fatal);
        }

        self.state.record_executed(txn_id);
        match result {
            Ok(payload) => self.complete_local_success(txn_id, payload),
            Err(error) => self.handle_local_abort(txn_id, error),
        }
    }

    fn complete_local_success(
        &mut self,
        txn_id: TxnId,
        payload: Bytes,
    ) -> Result<(), ExecutorError> {
        let response = ClientResponse::success(txn_id, payload);

        if self.state.current_dtxn() == Some(txn_id) {
            // Distributed transaction: the response waits for two-phase
            // commit; kick off the prepare phase.
            let txn = self
                .arena
                .get_mut(&txn_id)
                .ok_or_else(|| ExecutorError::Invariant("dtxn vanished from arena".to_string()))?;
            txn.pending_response = Some(response);
            let mut partitions: Vec<PartitionId> = txn.predicted_partitions.iter().copied().collect();
            for p in txn.touched_partitions() {
                if !partitions.contains(&p) {
                    partitions.push(p);
                }
            }
            let (decision_tx, _decision_rx) = oneshot::channel();
            self.coordinator
                .transaction_prepare(txn_id, decision_tx, partitions);
            return Ok(());
        }

        let (wrote, last_token) = {
            let txn = self
                .arena
                .get(&txn_id)
                .ok_or_else(|| ExecutorError::Invariant("txn vanished from arena".to_string()))?;
            // A speculative txn without a loggable token cannot be unwound
            // by a cascading rollback; releasing or buffering its response
            // would be unsound.
            if !txn.speculative_tokens_valid() {
                return Err(ExecutorError::Invariant(format!(
                    "speculative txn {} has no loggable undo token at partition {}",
                    txn_id, self.partition_id
                )));
            }
            (
                !txn.is_read_only_at(self.partition_id),
                txn.last_undo_token(self.partition_id),
            )
        };

        let dtxn_active = self.state.current_dtxn().is_some();
        let respond_now = if dtxn_active {
            match self.state.exec_mode() {
                // Read-only speculative work has nothing to commit; the
                // response can leave before the dtxn resolves.
                ExecMode::CommitReadOnly | ExecMode::CommitNonConflicting => !wrote,
                _ => false,
            }
        } else {
            // No dtxn holds the partition (CommitAll, or a halted
            // partition finishing a sysproc): commit and respond.
            true
        };

        if respond_now {
            if !dtxn_active && is_real_undo_token(last_token) {
                self.engine.release_undo_token(last_token);
                self.undo.commit(last_token)?;
            }
            self.state.record_committed(txn_id);
            self.finish_local(txn_id, response, Status::Ok);
        } else {
            self.state.push_blocked_response(txn_id, response, wrote);
            counters::BLOCKED_RESPONSES.set_with(
                &[&self.partition_id.to_string()],
                self.state.blocked_response_count() as i64,
            );
        }
        Ok(())
    }

    fn handle_local_abort(
        &mut self,
        txn_id: TxnId,
        error: TransactionError,
    ) -> Result<(), ExecutorError> {
        let status = error.status();

        if self.state.current_dtxn() == Some(txn_id) {
            // A distributed transaction's abort decision must reach every
            // involved partition. Route it through the coordinator; the
            // finish message coming back unwinds local effects.
            let partitions = {
                let txn = self.arena.get_mut(&txn_id).ok_or_else(|| {
                    ExecutorError::Invariant("aborting dtxn not in arena".to_string())
                })?;
                txn.pending_error = Some(error);
                let mut partitions: Vec<PartitionId> =
                    txn.predicted_partitions.iter().copied().collect();
                for p in txn.touched_partitions() {
                    if !partitions.contains(&p) {
                        partitions.push(p);
                    }
                }
                partitions
            };
            self.coordinator
                .transaction_finish(txn_id, status, partitions);
            return Ok(());
        }

        let (wrote, first_token, speculative, restart_count) = {
            let txn = match self.arena.get(&txn_id) {
                Some(txn) => txn,
                None => return Ok(()),
            };
            (
                !txn.is_read_only_at(self.partition_id),
                txn.first_undo_token(self.partition_id),
                txn.is_speculative(),
                txn.restart_count,
            )
        };
        debug!(
            partition = self.partition_id,
            txn_id = txn_id,
            status = status.get_label(),
            speculative = speculative,
            "transaction aborted locally"
        );

        // Roll back everything the attempt logged. The aborting transaction
        // holds the newest tokens, so this cannot take other work with it.
        if is_real_undo_token(first_token) {
            self.engine.undo_undo_token(first_token);
            self.undo.rollback(first_token)?;
        }

        if status.is_requeueable() && restart_count < self.config.max_restarts {
            let mut txn = self
                .arena
                .remove(&txn_id)
                .expect("aborting txn present in arena");
            let observed: Vec<PartitionId> = match &error {
                TransactionError::Mispredict { touched } => touched.clone(),
                _ => vec![],
            };
            counters::TRANSACTIONS
                .with_label_values(&[status.get_label()])
                .inc();
            txn.prepare_restart(observed);
            // The retry is a new transaction as far as the cluster is
            // concerned; the old id is finished everywhere.
            txn.id = self.txn_ids.next_id();
            self.lock_notifier
                .lock_queue_finished(txn_id, status, self.partition_id);
            self.self_sender
                .send(InternalMessage::InitializeTxn { txn })?;
        } else {
            let response = ClientResponse::aborted(txn_id, &error);
            self.finish_local(txn_id, response, status);
        }

        // A speculative abort that wrote poisons the window: stop all new
        // work until the dtxn resolves.
        if speculative && wrote && self.state.current_dtxn().is_some() {
            self.state.set_exec_mode(ExecMode::Disabled);
        }
        Ok(())
    }

    /// Terminal path for a transaction at its base partition: respond,
    /// notify the lock-queue manager, and drop the arena entry.
    fn finish_local(&mut self, txn_id: TxnId, response: ClientResponse, status: Status) {
        counters::TRANSACTIONS
            .with_label_values(&[status.get_label()])
            .inc();
        if let Some(mut txn) = self.arena.remove(&txn_id) {
            txn.mark_finished(self.partition_id);
            if let Some(client) = txn.client.take() {
                let _ = client.send(response);
            }
        }
        self.recently_finished.insert(txn_id);
        self.lock_notifier
            .lock_queue_finished(txn_id, status, self.partition_id);
    }

    fn reject_transaction(&mut self, txn_id: TxnId) {
        self.lock_queue.cancel(txn_id);
        let response = ClientResponse::aborted(txn_id, &TransactionError::Reject);
        self.finish_local(txn_id, response, Status::AbortReject);
    }

    // ------------------------------------------------------------------
    // Batch execution (called from ProcedureContext)

    pub(crate) fn execute_batch(
        &mut self,
        txn_id: TxnId,
        plan: BatchPlan,
    ) -> Result<DependencySet, TransactionError> {
        let touched = plan.touched_partitions();
        {
            let txn = self
                .arena
                .get(&txn_id)
                .ok_or_else(|| TransactionError::Unexpected("txn not in arena".to_string()))?;
            for partition in &touched {
                let mispredicted = (*partition != txn.base_partition
                    && txn.is_predicted_single_partition())
                    || !txn.predicted_partitions.contains(partition)
                    || txn.done_partitions.contains(partition);
                if mispredicted {
                    return Err(TransactionError::Mispredict {
                        touched: touched.clone(),
                    });
                }
            }
        }

        let (local, remote): (Vec<WorkFragment>, Vec<WorkFragment>) = plan
            .fragments
            .into_iter()
            .partition(|f| f.partition_id == self.partition_id);

        let mut pending = if remote.is_empty() {
            None
        } else {
            let dispatched = {
                let procedure = self
                    .arena
                    .get(&txn_id)
                    .map(|t| t.procedure.clone())
                    .unwrap_or_default();
                let dispatcher = &self.dispatcher;
                let txn = self.arena.get_mut(&txn_id).expect("txn checked above");
                dispatcher.dispatch(txn, &procedure, &plan.params, remote)
            };
            match dispatched {
                Ok(pending) => Some(pending),
                Err(e) => return Err(self.note_fatal(e)),
            }
        };

        let mut results = DependencySet::new();
        let (ready, needs_input): (Vec<WorkFragment>, Vec<WorkFragment>) =
            local.into_iter().partition(|f| !f.needs_input);

        for fragment in &ready {
            let deps = self.execute_local_fragment(
                txn_id,
                fragment,
                &plan.params,
                DependencySet::new(),
            )?;
            results.extend(deps);
        }

        // Count-down latch: wait for every remote dependency, filling idle
        // polls with utility work.
        if let Some(pending) = pending.as_mut() {
            let poll_timeout = Duration::from_micros(self.config.work_queue_poll_us.max(10));
            loop {
                match pending.poll(poll_timeout) {
                    Ok(true) => break,
                    Ok(false) => {
                        if let Err(e) = self.utility_work() {
                            return Err(self.note_fatal(e));
                        }
                    },
                    Err(e) => return Err(self.note_fatal(e)),
                }
            }
        }
        if let Some(pending) = pending {
            results.extend(pending.into_result()?);
        }

        // Dependencies that arrived ahead of the rounds consuming them go to
        // the engine's staging area before those rounds run.
        if !needs_input.is_empty() {
            let staged: DependencySet = needs_input
                .iter()
                .flat_map(|f| f.input_dep_ids.iter())
                .filter_map(|id| results.get(id).map(|data| (*id, data.clone())))
                .collect();
            if !staged.is_empty() {
                self.engine.stash_work_unit_dependencies(staged);
            }
        }
        for fragment in &needs_input {
            let inputs: DependencySet = fragment
                .input_dep_ids
                .iter()
                .filter_map(|id| results.get(id).map(|data| (*id, data.clone())))
                .collect();
            let deps = self.execute_local_fragment(txn_id, fragment, &plan.params, inputs)?;
            results.extend(deps);
        }

        // Partitions that saw their last fragment are done; touching them
        // again is a misprediction.
        if let Some(txn) = self.arena.get_mut(&txn_id) {
            for partition in touched {
                txn.done_partitions.insert(partition);
            }
        }
        Ok(results)
    }

    fn execute_local_fragment(
        &mut self,
        txn_id: TxnId,
        fragment: &WorkFragment,
        params: &[Bytes],
        inputs: DependencySet,
    ) -> Result<DependencySet, TransactionError> {
        let (round, procedure) = {
            let txn = self
                .arena
                .get(&txn_id)
                .ok_or_else(|| TransactionError::Unexpected("txn not in arena".to_string()))?;
            let round = if txn.is_speculative() {
                RoundKind::Speculative
            } else if fragment.read_only {
                RoundKind::ReadOnly
            } else {
                let remainder_safe = fragment.last_fragment
                    && self
                        .catalog
                        .get(&txn.procedure)
                        .map_or(false, |d| !d.abortable);
                RoundKind::Write {
                    // Remote handles carry no predictions; they are by
                    // definition part of a multi-partition transaction.
                    multi_partition: txn.remote || !txn.is_predicted_single_partition(),
                    remainder_safe,
                }
            };
            (round, txn.procedure.clone())
        };

        let token = {
            let txn = self.arena.get_mut(&txn_id).expect("txn checked above");
            let token = self
                .undo
                .acquire(txn.work_mut(self.partition_id), round);
            txn.work_mut(self.partition_id)
                .record_round(token, fragment.read_only);
            token
        };

        // A write by the current dtxn flips the partition into full response
        // buffering.
        if !fragment.read_only && self.state.current_dtxn() == Some(txn_id) {
            self.state.set_exec_mode(ExecMode::CommitNone);
        }

        let work = WorkUnit {
            fragment_ids: fragment.fragment_ids.clone(),
            params: fragment
                .param_indices
                .iter()
                .map(|i| params.get(*i as usize).cloned().unwrap_or_default())
                .collect(),
            input_deps: inputs,
            output_dep_ids: fragment.output_dep_ids.clone(),
            txn_id,
            last_committed_txn: self.state.last_committed_txn_id(),
            undo_token: token,
        };
        trace!(
            partition = self.partition_id,
            txn_id = txn_id,
            procedure = %procedure,
            undo_token = token,
            read_only = fragment.read_only,
            "executing plan fragments"
        );
        match self.engine.execute_plan_fragments(&work) {
            Ok(deps) => Ok(deps),
            Err(EngineError::Fatal(m)) => {
                Err(self.note_fatal(ExecutorError::Engine(EngineError::Fatal(m))))
            },
            Err(EngineError::EvictedAccess { table }) => {
                Err(TransactionError::EvictedAccess { table })
            },
            Err(e) => Err(TransactionError::Unexpected(e.to_string())),
        }
    }

    /// Records a fatal fault and hands back the transaction-level error that
    /// unwinds the procedure; the fault itself is re-raised by the loop.
    fn note_fatal(&mut self, error: ExecutorError) -> TransactionError {
        let message = error.to_string();
        self.pending_fatal = Some(error);
        TransactionError::Unexpected(message)
    }

    // ------------------------------------------------------------------
    // Distributed transactions at a remote partition

    #[allow(clippy::too_many_arguments)]
    fn handle_work_fragment(
        &mut self,
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: String,
        params: Vec<Bytes>,
        fragment: WorkFragment,
        reply: crossbeam_channel::Sender<WorkResult>,
    ) -> Result<(), ExecutorError> {
        let finished_here = self.recently_finished.contains(&txn_id)
            || self
                .arena
                .get(&txn_id)
                .map_or(false, |t| t.is_finished(self.partition_id));
        if finished_here {
            let _ = reply.send(WorkResult::error(
                self.partition_id,
                Status::AbortUnexpected,
                format!("txn {} already finished at this partition", txn_id),
            ));
            return Ok(());
        }

        self.arena.entry(txn_id).or_insert_with(|| {
            TransactionState::new_remote_handle(txn_id, base_partition, procedure, Bytes::new())
        });
        if !self.state.install_dtxn(txn_id) {
            return Err(ExecutorError::Invariant(format!(
                "work fragment for txn {} dispatched past the dtxn gate",
                txn_id
            )));
        }

        if fragment.prefetch {
            // Speculative work: run without logging and push the result
            // toward the base partition instead of replying.
            let result = self.execute_prefetch_fragment(txn_id, &fragment, &params);
            self.coordinator.transaction_prefetch_result(txn_id, result);
            return Ok(());
        }

        let future_statements = fragment.future_statements.clone();
        let result = match self.execute_local_fragment(
            txn_id,
            &fragment,
            &params,
            DependencySet::new(),
        ) {
            Ok(deps) => {
                let (dep_ids, dep_data): (Vec<_>, Vec<_>) = deps.into_iter().unzip();
                WorkResult {
                    partition_id: self.partition_id,
                    status: Status::Ok,
                    dep_ids,
                    dep_data,
                    error: None,
                }
            },
            Err(error) => {
                // The abort decision belongs to the base partition; local
                // effects roll back when the finish arrives.
                WorkResult::error(self.partition_id, error.status(), error.to_string())
            },
        };
        if let Some(fatal) = self.pending_fatal.take() {
            return Err(fatal);
        }
        let _ = reply.send(result);

        // Results the transaction asked us to compute ahead of demand.
        for future in future_statements {
            let prefetch = WorkFragment {
                partition_id: self.partition_id,
                fragment_ids: vec![future.fragment_id],
                param_indices: vec![],
                input_dep_ids: vec![],
                output_dep_ids: vec![future.fragment_id],
                read_only: true,
                last_fragment: false,
                prefetch: true,
                needs_input: false,
                future_statements: vec![],
            };
            let result = self.execute_prefetch_fragment(txn_id, &prefetch, &params);
            self.coordinator.transaction_prefetch_result(txn_id, result);
        }
        Ok(())
    }

    fn execute_prefetch_fragment(
        &mut self,
        txn_id: TxnId,
        fragment: &WorkFragment,
        params: &[Bytes],
    ) -> WorkResult {
        let work = WorkUnit {
            fragment_ids: fragment.fragment_ids.clone(),
            params: fragment
                .param_indices
                .iter()
                .map(|i| params.get(*i as usize).cloned().unwrap_or_default())
                .collect(),
            input_deps: DependencySet::new(),
            output_dep_ids: fragment.output_dep_ids.clone(),
            txn_id,
            last_committed_txn: self.state.last_committed_txn_id(),
            undo_token: DISABLE_UNDO_TOKEN,
        };
        match self.engine.execute_plan_fragments(&work) {
            Ok(deps) => {
                let (dep_ids, dep_data): (Vec<_>, Vec<_>) = deps.into_iter().unzip();
                WorkResult {
                    partition_id: self.partition_id,
                    status: Status::Ok,
                    dep_ids,
                    dep_data,
                    error: None,
                }
            },
            Err(e) => WorkResult::error(self.partition_id, Status::AbortUnexpected, e.to_string()),
        }
    }

    fn handle_set_distributed_txn(
        &mut self,
        txn_id: TxnId,
        base_partition: PartitionId,
        procedure: String,
        params: Bytes,
        released: Option<oneshot::Sender<PartitionId>>,
    ) {
        if self.recently_finished.contains(&txn_id) {
            warn!(
                partition = self.partition_id,
                txn_id = txn_id,
                "dropping lock request for finished transaction"
            );
            return;
        }
        self.arena.entry(txn_id).or_insert_with(|| {
            TransactionState::new_remote_handle(txn_id, base_partition, procedure, params)
        });
        let mut request = LockRequest::new(txn_id, false, false);
        if let Some(callback) = released {
            request = request.with_release_callback(callback);
        }
        self.lock_queue.insert(request);
    }

    // ------------------------------------------------------------------
    // Prepare / finish protocol

    fn handle_prepare(&mut self, txn_id: TxnId, callback: Option<oneshot::Sender<PartitionId>>) {
        if let Some(txn) = self.arena.get_mut(&txn_id) {
            // Idempotent: only the first prepare changes state.
            if txn.mark_prepared(self.partition_id)
                && self.state.current_dtxn() == Some(txn_id)
                && !self.state.is_halted()
            {
                let mode = if txn.is_read_only_at(self.partition_id) {
                    ExecMode::CommitReadOnly
                } else {
                    ExecMode::CommitNone
                };
                self.state.set_exec_mode(mode);
            }
        } else {
            warn!(
                partition = self.partition_id,
                txn_id = txn_id,
                "prepare for unknown transaction"
            );
        }
        if let Some(callback) = callback {
            let _ = callback.send(self.partition_id);
        }
    }

    fn handle_finish(&mut self, txn_id: TxnId, status: Status) -> Result<(), ExecutorError> {
        if self.state.current_dtxn() == Some(txn_id) {
            return self.finish_current_dtxn(txn_id, status);
        }

        // A finish for a transaction that never held this partition's lock
        // must be an abort; hand it to the lock-queue manager.
        if status == Status::Ok {
            return Err(ExecutorError::Invariant(format!(
                "commit finish for txn {} which is not the current dtxn",
                txn_id
            )));
        }
        self.lock_queue.cancel(txn_id);
        if let Some(mut txn) = self.arena.remove(&txn_id) {
            if let Some(client) = txn.client.take() {
                let _ = client.send(ClientResponse {
                    txn_id,
                    status,
                    payload: Bytes::new(),
                    error: Some("aborted before acquiring the partition lock".to_string()),
                });
            }
        }
        self.lock_notifier
            .lock_queue_finished(txn_id, status, self.partition_id);
        Ok(())
    }

    /// The hard part: resolve the current dtxn and everything speculated on
    /// top of it.
    fn finish_current_dtxn(&mut self, txn_id: TxnId, status: Status) -> Result<(), ExecutorError> {
        let mut dtxn = self
            .arena
            .remove(&txn_id)
            .ok_or_else(|| ExecutorError::Invariant("current dtxn not in arena".to_string()))?;
        let wrote_here = !dtxn.is_read_only_at(self.partition_id);
        let spec_buffer = self.state.take_blocked_responses();

        let outcome = if status == Status::Ok || !wrote_here {
            // Commit, or an abort that never wrote here: the newest
            // token is a superset covering the dtxn plus every speculative
            // round layered on top; one release commits them all.
            if let Some(max) = self.undo.max_outstanding() {
                self.engine.release_undo_token(max);
                self.undo.commit(max)?;
            }
            for (spec_id, response) in spec_buffer {
                self.release_speculative_response(spec_id, response);
            }
            if status == Status::Ok {
                "commit"
            } else {
                "abort_read_only"
            }
        } else {
            // The dtxn wrote and aborts. Speculative rounds strictly
            // below its first write committed against pre-dtxn state; the
            // rest may have read dirty writes and must restart.
            let dtxn_first = dtxn.first_undo_token(self.partition_id);
            if !is_real_undo_token(dtxn_first) {
                return Err(ExecutorError::Invariant(format!(
                    "dtxn {} wrote at partition {} without an undo token",
                    txn_id, self.partition_id
                )));
            }

            let (commit_set, restart_set): (Vec<_>, Vec<_>) =
                spec_buffer.into_iter().partition(|(spec_id, _)| {
                    let first = self
                        .arena
                        .get(spec_id)
                        .map(|t| t.first_undo_token(self.partition_id))
                        .unwrap_or(NULL_UNDO_TOKEN);
                    first == NULL_UNDO_TOKEN || first < dtxn_first
                });

            if let Some(commit_token) = self.undo.max_outstanding_below(dtxn_first) {
                self.engine.release_undo_token(commit_token);
                self.undo.commit(commit_token)?;
            }
            for (spec_id, response) in commit_set {
                self.release_speculative_response(spec_id, response);
            }

            self.engine.undo_undo_token(dtxn_first);
            self.undo.rollback(dtxn_first)?;

            for (spec_id, _response) in restart_set {
                self.restart_speculative_txn(spec_id)?;
            }
            "abort_cascade"
        };
        counters::DTXN_FINISHES.with_label_values(&[outcome]).inc();

        // The dtxn's own outcome (base partition only): requeueable aborts
        // restart transparently, everything else answers the client.
        dtxn.mark_finished(self.partition_id);
        counters::TRANSACTIONS
            .with_label_values(&[status.get_label()])
            .inc();
        let requeue = status.is_requeueable()
            && !dtxn.remote
            && dtxn.client.is_some()
            && dtxn.restart_count < self.config.max_restarts;
        if requeue {
            let observed: Vec<PartitionId> = match &dtxn.pending_error {
                Some(TransactionError::Mispredict { touched }) => touched.clone(),
                _ => vec![],
            };
            dtxn.prepare_restart(observed);
            dtxn.id = self.txn_ids.next_id();
            self.self_sender
                .send(InternalMessage::InitializeTxn { txn: dtxn })?;
        } else {
            if let Some(client) = dtxn.client.take() {
                let response = if status == Status::Ok {
                    dtxn.pending_response
                        .take()
                        .unwrap_or_else(|| ClientResponse::success(txn_id, Bytes::new()))
                } else {
                    ClientResponse {
                        txn_id,
                        status,
                        payload: Bytes::new(),
                        error: dtxn.pending_error.as_ref().map(|e| e.to_string()),
                    }
                };
                let _ = client.send(response);
            }
            if status == Status::Ok {
                self.state.record_committed(txn_id);
            }
        }

        debug!(
            partition = self.partition_id,
            txn_id = txn_id,
            status = status.get_label(),
            outcome = outcome,
            "distributed transaction finished"
        );

        // Reopen the partition: blocked messages go back on the work queue
        // in arrival order, ahead of any new arrivals racing in.
        let blocked = self.state.clear_dtxn(txn_id);
        for msg in blocked {
            self.self_sender.send(msg)?;
        }
        self.recently_finished.insert(txn_id);
        self.lock_notifier
            .lock_queue_finished(txn_id, status, self.partition_id);
        Ok(())
    }

    fn release_speculative_response(&mut self, txn_id: TxnId, response: ClientResponse) {
        self.state.record_committed(txn_id);
        self.finish_local(txn_id, response, Status::Ok);
    }

    /// Cascading-abort restart: the speculative transaction read dirty state, so
    /// its attempt is voided and it is re-queued transparently.
    fn restart_speculative_txn(&mut self, txn_id: TxnId) -> Result<(), ExecutorError> {
        counters::TRANSACTIONS
            .with_label_values(&[Status::AbortSpeculative.get_label()])
            .inc();
        let mut txn = match self.arena.remove(&txn_id) {
            Some(txn) => txn,
            None => return Ok(()),
        };
        self.lock_notifier.lock_queue_finished(
            txn_id,
            Status::AbortSpeculative,
            self.partition_id,
        );
        if txn.restart_count < self.config.max_restarts {
            txn.prepare_restart([]);
            txn.id = self.txn_ids.next_id();
            self.self_sender
                .send(InternalMessage::InitializeTxn { txn })?;
        } else if let Some(client) = txn.client.take() {
            let _ = client.send(ClientResponse::aborted(
                txn_id,
                &TransactionError::Speculative,
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Utility work & maintenance

    /// Fills an idle slot: admits work that arrived while the executor was
    /// parked on a dispatch latch, then runs one speculative candidate if
    /// any is safe.
    fn utility_work(&mut self) -> Result<(), ExecutorError> {
        if !self.config.speculative_execution_enabled {
            return Ok(());
        }
        if self.state.current_dtxn().is_none() {
            return Ok(());
        }

        // Initializations and speculative starts keep flowing during the
        // latch; only the current dtxn's own finish must wait for its
        // procedure to unwind back to the loop.
        while let Some(msg) = self.work_queue.try_poll() {
            let must_wait = matches!(
                &msg,
                InternalMessage::Finish { txn_id, .. }
                    if Some(*txn_id) == self.state.current_dtxn()
            );
            if must_wait {
                self.stashed_messages.push_back(msg);
                break;
            }
            self.dispatch_message(msg)?;
        }

        let dtxn_id = match self.state.current_dtxn() {
            Some(id) => id,
            None => return Ok(()),
        };
        match self.state.exec_mode() {
            ExecMode::Disabled | ExecMode::DisabledReject => return Ok(()),
            _ => {},
        }

        let (candidate, spec_type) = {
            let arena = &self.arena;
            let work_queue = &self.work_queue;
            let dtxn = match arena.get(&dtxn_id) {
                Some(dtxn) => dtxn,
                None => return Ok(()),
            };
            let spec_type = compute_spec_type(dtxn, self.partition_id);
            let candidate = self.scheduler.next_candidate(
                dtxn,
                spec_type,
                &mut self.lock_queue,
                arena,
                || work_queue.interrupt_pending(),
            );
            (candidate, spec_type)
        };

        if let Some(candidate) = candidate {
            self.run_local_transaction(candidate, Some(spec_type))?;
        }
        Ok(())
    }

    fn maybe_tick(&mut self) {
        if self.last_tick.elapsed() < Duration::from_millis(self.config.tick_interval_ms) {
            return;
        }
        self.last_tick = Instant::now();
        let ts_ms = duration_since_epoch().as_millis() as u64;
        self.engine.tick(ts_ms, self.state.last_committed_txn_id());

        // Bound the late-message guard; anything this old has drained from
        // the cluster.
        if self.recently_finished.len() > 100_000 {
            self.recently_finished.clear();
        }

        let partition = self.partition_id.to_string();
        counters::WORK_QUEUE_DEPTH.set_with(&[&partition], self.work_queue.len() as i64);
        counters::LOCK_QUEUE_DEPTH.set_with(&[&partition], self.lock_queue.len() as i64);
        counters::BLOCKED_RESPONSES
            .set_with(&[&partition], self.state.blocked_response_count() as i64);
    }

    fn handle_deferred_query(&mut self, txn_id: TxnId, plan: BatchPlan) {
        if !self.arena.contains_key(&txn_id) {
            debug!(
                partition = self.partition_id,
                txn_id = txn_id,
                "dropping deferred query for finished transaction"
            );
            return;
        }
        for fragment in &plan.fragments {
            if fragment.partition_id != self.partition_id || !fragment.read_only {
                continue;
            }
            let result = self.execute_prefetch_fragment(txn_id, fragment, &plan.params);
            if result.status == Status::Ok {
                if let Some(txn) = self.arena.get_mut(&txn_id) {
                    txn.prefetch_results
                        .insert(fragment.prefetch_key(&plan.params), result.dep_data);
                }
            }
        }
    }

    fn handle_update_memory(&mut self) {
        let ts_ms = duration_since_epoch().as_millis() as u64;
        match self.engine.get_stats(StatsSelector::Memory, &[], ts_ms) {
            Ok(stats) => {
                let bytes: u64 = stats.iter().map(|t| t.tuple_bytes).sum();
                debug!(
                    partition = self.partition_id,
                    bytes = bytes,
                    "refreshed memory statistics"
                );
            },
            Err(e) => warn!(
                partition = self.partition_id,
                error = ?e,
                "memory statistics refresh failed"
            ),
        }
    }

    fn handle_snapshot_work(&mut self) {
        // Snapshot persistence itself is out of scope; the message exists so
        // the snapshot coordinator can rendezvous with the executor thread.
        let ts_ms = duration_since_epoch().as_millis() as u64;
        self.engine.tick(ts_ms, self.state.last_committed_txn_id());
        debug!(partition = self.partition_id, "snapshot sync point");
    }

    fn handle_table_stats(
        &mut self,
        selector: StatsSelector,
        table_ids: Vec<u32>,
        callback: oneshot::Sender<Vec<kiln_storage_interface::TableStats>>,
    ) {
        let ts_ms = duration_since_epoch().as_millis() as u64;
        let stats = self
            .engine
            .get_stats(selector, &table_ids, ts_ms)
            .unwrap_or_default();
        let _ = callback.send(stats);
    }

    /// Bulk-loads rows into a table under the transaction's undo token, for
    /// loader system procedures.
    pub(crate) fn load_table(
        &mut self,
        txn_id: TxnId,
        table: &str,
        rows: Bytes,
        allow_export: bool,
    ) -> Result<(), TransactionError> {
        let token = {
            let txn = self
                .arena
                .get_mut(&txn_id)
                .ok_or_else(|| TransactionError::Unexpected("txn not in arena".to_string()))?;
            let round = if txn.is_speculative() {
                RoundKind::Speculative
            } else {
                RoundKind::Write {
                    multi_partition: txn.remote || !txn.is_predicted_single_partition(),
                    remainder_safe: false,
                }
            };
            let token = self.undo.acquire(txn.work_mut(self.partition_id), round);
            txn.work_mut(self.partition_id).record_round(token, false);
            token
        };
        let last_committed = self.state.last_committed_txn_id();
        match self
            .engine
            .load_table(table, rows, txn_id, last_committed, token, allow_export)
        {
            Ok(()) => Ok(()),
            Err(EngineError::Fatal(m)) => {
                Err(self.note_fatal(ExecutorError::Engine(EngineError::Fatal(m))))
            },
            Err(e) => Err(TransactionError::Unexpected(e.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // ProcedureContext accessors

    pub(crate) fn txn_params(&self, txn_id: TxnId) -> Bytes {
        self.arena
            .get(&txn_id)
            .map(|t| t.params.clone())
            .unwrap_or_default()
    }

    pub(crate) fn txn_is_speculative(&self, txn_id: TxnId) -> bool {
        self.arena
            .get(&txn_id)
            .map_or(false, |t| t.is_speculative())
    }

    pub(crate) fn txn_restart_count(&self, txn_id: TxnId) -> u32 {
        self.arena.get(&txn_id).map_or(0, |t| t.restart_count)
    }

    pub(crate) fn halt_partition(&mut self) {
        warn!(partition = self.partition_id, "partition entering halt mode");
        self.state.set_exec_mode(ExecMode::DisabledReject);
    }
}
