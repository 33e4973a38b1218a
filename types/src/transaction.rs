// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction bookkeeping. A transaction lives in its base partition's
//! arena; other partitions it touches hold a lightweight remote handle that
//! carries only the id, parameters, and that partition's work record.

use crate::{
    ids::{PartitionId, TxnId, UndoToken, DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN},
    message::PrefetchKey,
    status::{Status, TransactionError},
};
use bytes::Bytes;
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What kind of speculation window a transaction was dispatched under.
/// Assigned by the speculative scheduler when it releases a candidate.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SpecType {
    /// No distributed transaction holds the partition.
    Idle,
    /// Local dtxn is mid-execution here.
    Sp1Local,
    /// Remote dtxn has not run at this partition yet.
    Sp2RemoteBefore,
    /// Remote dtxn has already run at this partition.
    Sp2RemoteAfter,
    /// Local dtxn is prepared here.
    Sp3Local,
    /// Remote dtxn is prepared here.
    Sp3Remote,
}

impl SpecType {
    /// Stall-point types: the dtxn can do no further local work, so any
    /// single-partition candidate is safe without a conflict check.
    pub fn is_stall_point(self) -> bool {
        matches!(
            self,
            SpecType::Idle | SpecType::Sp2RemoteBefore | SpecType::Sp3Local | SpecType::Sp3Remote
        )
    }

    /// Returns a summary label for the speculation type
    pub fn get_label(self) -> &'static str {
        match self {
            SpecType::Idle => "idle",
            SpecType::Sp1Local => "sp1_local",
            SpecType::Sp2RemoteBefore => "sp2_remote_before",
            SpecType::Sp2RemoteAfter => "sp2_remote_after",
            SpecType::Sp3Local => "sp3_local",
            SpecType::Sp3Remote => "sp3_remote",
        }
    }
}

/// What a transaction has done at one partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionWork {
    /// Still true only while every round at this partition was read-only.
    pub read_only: bool,
    /// At least one execution round ran here.
    pub executed: bool,
    pub first_undo_token: UndoToken,
    pub last_undo_token: UndoToken,
    pub prepared: bool,
    pub finished: bool,
}

impl Default for PartitionWork {
    fn default() -> Self {
        Self {
            read_only: true,
            executed: false,
            first_undo_token: NULL_UNDO_TOKEN,
            last_undo_token: NULL_UNDO_TOKEN,
            prepared: false,
            finished: false,
        }
    }
}

impl PartitionWork {
    /// Records one execution round with the token the engine ran under.
    /// `DISABLE_UNDO_TOKEN` rounds leave the token bounds untouched.
    pub fn record_round(&mut self, token: UndoToken, read_only: bool) {
        self.executed = true;
        self.read_only &= read_only;
        if token != NULL_UNDO_TOKEN && token != DISABLE_UNDO_TOKEN {
            if self.first_undo_token == NULL_UNDO_TOKEN {
                self.first_undo_token = token;
            }
            self.last_undo_token = token;
            assert!(
                self.first_undo_token <= self.last_undo_token,
                "undo token range inverted: {} > {}",
                self.first_undo_token,
                self.last_undo_token,
            );
        }
    }
}

/// Response delivered to the client exactly once per transaction attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientResponse {
    pub txn_id: TxnId,
    pub status: Status,
    /// Serialized procedure result; empty on abort.
    pub payload: Bytes,
    pub error: Option<String>,
}

impl ClientResponse {
    pub fn success(txn_id: TxnId, payload: Bytes) -> Self {
        Self {
            txn_id,
            status: Status::Ok,
            payload,
            error: None,
        }
    }

    pub fn aborted(txn_id: TxnId, error: &TransactionError) -> Self {
        Self {
            txn_id,
            status: error.status(),
            payload: Bytes::new(),
            error: Some(error.to_string()),
        }
    }
}

/// One-shot sender the executor resolves with the final [`ClientResponse`].
pub type ClientResponseSender = oneshot::Sender<ClientResponse>;

/// A raw invocation as received from a client, before the initializer has
/// assigned a transaction id.
#[derive(Debug)]
pub struct NewTransactionRequest {
    pub procedure: String,
    pub params: Bytes,
    pub base_partition: PartitionId,
    /// Partitions the (external) planner predicts the txn will touch; the
    /// base partition is always included.
    pub predicted_partitions: BTreeSet<PartitionId>,
    pub predicted_read_only: bool,
    pub initiate_time_us: u64,
    pub client: ClientResponseSender,
}

/// Full transaction state, owned by the base partition's executor.
#[derive(Debug)]
pub struct TransactionState {
    pub id: TxnId,
    pub base_partition: PartitionId,
    pub procedure: String,
    pub params: Bytes,
    pub predicted_partitions: BTreeSet<PartitionId>,
    pub predicted_read_only: bool,
    pub sysproc: bool,
    pub initiate_time_us: u64,
    pub speculative_type: Option<SpecType>,
    pub restart_count: u32,
    pub pending_error: Option<TransactionError>,
    /// Results fetched ahead of demand, keyed by fragment signature.
    pub prefetch_results: HashMap<PrefetchKey, Vec<Bytes>>,
    /// Partitions that already saw this txn's last fragment; touching one of
    /// these again is a misprediction.
    pub done_partitions: BTreeSet<PartitionId>,
    /// True for the lightweight handle held at non-base partitions.
    pub remote: bool,
    pub client: Option<ClientResponseSender>,
    /// A finished distributed transaction's response, held at the base
    /// partition until two-phase commit decides.
    pub pending_response: Option<ClientResponse>,
    work: HashMap<PartitionId, PartitionWork>,
}

impl TransactionState {
    pub fn new(id: TxnId, request: NewTransactionRequest, sysproc: bool) -> Self {
        let mut predicted_partitions = request.predicted_partitions;
        predicted_partitions.insert(request.base_partition);
        Self {
            id,
            base_partition: request.base_partition,
            procedure: request.procedure,
            params: request.params,
            predicted_partitions,
            predicted_read_only: request.predicted_read_only,
            sysproc,
            initiate_time_us: request.initiate_time_us,
            speculative_type: None,
            restart_count: 0,
            pending_error: None,
            prefetch_results: HashMap::new(),
            done_partitions: BTreeSet::new(),
            remote: false,
            client: Some(request.client),
            pending_response: None,
            work: HashMap::new(),
        }
    }

    /// The handle a non-base partition keeps for a distributed transaction:
    /// id and parameters only, no client channel, no predictions.
    pub fn new_remote_handle(
        id: TxnId,
        base_partition: PartitionId,
        procedure: String,
        params: Bytes,
    ) -> Self {
        Self {
            id,
            base_partition,
            procedure,
            params,
            predicted_partitions: BTreeSet::new(),
            predicted_read_only: false,
            sysproc: false,
            initiate_time_us: 0,
            speculative_type: None,
            restart_count: 0,
            pending_error: None,
            prefetch_results: HashMap::new(),
            done_partitions: BTreeSet::new(),
            remote: true,
            client: None,
            pending_response: None,
            work: HashMap::new(),
        }
    }

    pub fn is_predicted_single_partition(&self) -> bool {
        self.predicted_partitions.len() <= 1
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative_type
            .map_or(false, |t| t != SpecType::Idle)
    }

    pub fn work(&self, partition: PartitionId) -> Option<&PartitionWork> {
        self.work.get(&partition)
    }

    pub fn work_mut(&mut self, partition: PartitionId) -> &mut PartitionWork {
        self.work.entry(partition).or_default()
    }

    pub fn touched_partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.work.keys().copied()
    }

    pub fn executed_at(&self, partition: PartitionId) -> bool {
        self.work.get(&partition).map_or(false, |w| w.executed)
    }

    pub fn is_read_only_at(&self, partition: PartitionId) -> bool {
        self.work.get(&partition).map_or(true, |w| w.read_only)
    }

    pub fn first_undo_token(&self, partition: PartitionId) -> UndoToken {
        self.work
            .get(&partition)
            .map_or(NULL_UNDO_TOKEN, |w| w.first_undo_token)
    }

    pub fn last_undo_token(&self, partition: PartitionId) -> UndoToken {
        self.work
            .get(&partition)
            .map_or(NULL_UNDO_TOKEN, |w| w.last_undo_token)
    }

    /// Marks the partition prepared. Returns false when already prepared, so
    /// repeated prepares stay no-ops.
    pub fn mark_prepared(&mut self, partition: PartitionId) -> bool {
        let work = self.work.entry(partition).or_default();
        !std::mem::replace(&mut work.prepared, true)
    }

    pub fn is_prepared(&self, partition: PartitionId) -> bool {
        self.work.get(&partition).map_or(false, |w| w.prepared)
    }

    /// Marks the partition finished. Returns false when already finished; no
    /// further work for the txn is accepted at that partition afterwards.
    pub fn mark_finished(&mut self, partition: PartitionId) -> bool {
        let work = self.work.entry(partition).or_default();
        !std::mem::replace(&mut work.finished, true)
    }

    pub fn is_finished(&self, partition: PartitionId) -> bool {
        self.work.get(&partition).map_or(false, |w| w.finished)
    }

    pub fn is_finished_everywhere(&self) -> bool {
        !self.work.is_empty() && self.work.values().all(|w| w.finished)
    }

    /// Speculative txns must carry a real (loggable) undo token at every
    /// partition where they did non-read-only work; otherwise a cascading
    /// rollback could not unwind them.
    pub fn speculative_tokens_valid(&self) -> bool {
        !self.is_speculative()
            || self.work.values().all(|w| {
                w.read_only || (w.executed && w.first_undo_token != NULL_UNDO_TOKEN)
            })
    }

    /// Resets per-attempt state ahead of a mispredict/speculative restart.
    pub fn prepare_restart(&mut self, observed_partitions: impl IntoIterator<Item = PartitionId>) {
        self.predicted_partitions.extend(observed_partitions);
        self.predicted_partitions.insert(self.base_partition);
        self.restart_count += 1;
        self.speculative_type = None;
        self.pending_error = None;
        self.pending_response = None;
        self.done_partitions.clear();
        self.work.clear();
    }
}
