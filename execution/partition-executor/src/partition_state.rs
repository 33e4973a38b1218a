// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Distributed-transaction state for one partition: the single current
//! dtxn, the execution mode gating client responses, the messages blocked
//! behind the dtxn, and the buffer of speculative responses awaiting its
//! outcome.

use crate::message::InternalMessage;
use kiln_logger::prelude::*;
use kiln_types::{transaction::ClientResponse, PartitionId, TxnId};
use std::collections::VecDeque;

/// Gates whether a finished transaction's response may leave the partition
/// right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecMode {
    /// Speculation halted after a speculative abort; all new work blocks.
    Disabled,
    /// Halt: new non-sysproc transactions are rejected outright.
    DisabledReject,
    /// No dtxn active; single-partition transactions commit and respond
    /// immediately.
    CommitAll,
    /// Dtxn active but read-only here; read-only speculative responses may
    /// leave immediately.
    CommitReadOnly,
    /// Dtxn active; speculative responses proven non-conflicting may leave.
    CommitNonConflicting,
    /// Dtxn active and has written here; every speculative response queues.
    CommitNone,
}

impl ExecMode {
    /// Returns a summary label for the mode
    pub fn get_label(self) -> &'static str {
        match self {
            ExecMode::Disabled => "disabled",
            ExecMode::DisabledReject => "disabled_reject",
            ExecMode::CommitAll => "commit_all",
            ExecMode::CommitReadOnly => "commit_readonly",
            ExecMode::CommitNonConflicting => "commit_nonconflicting",
            ExecMode::CommitNone => "commit_none",
        }
    }
}

#[derive(Debug)]
pub struct PartitionState {
    partition: PartitionId,
    exec_mode: ExecMode,
    current_dtxn: Option<TxnId>,
    /// Messages serialized behind the current dtxn, replayed on finish.
    blocked_messages: VecDeque<InternalMessage>,
    /// Speculative responses in dispatch order, gated on the dtxn outcome.
    /// Pushed like a stack for the cascading-abort walk; drained in dispatch
    /// order on release.
    spec_exec_blocked: Vec<(TxnId, ClientResponse)>,
    /// A buffered speculative transaction wrote to the partition.
    spec_exec_modified: bool,
    last_executed_txn_id: Option<TxnId>,
    last_committed_txn_id: TxnId,
}

impl PartitionState {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            exec_mode: ExecMode::CommitAll,
            current_dtxn: None,
            blocked_messages: VecDeque::new(),
            spec_exec_blocked: Vec::new(),
            spec_exec_modified: false,
            last_executed_txn_id: None,
            last_committed_txn_id: 0,
        }
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    pub fn set_exec_mode(&mut self, mode: ExecMode) {
        if self.exec_mode != mode {
            debug!(
                partition = self.partition,
                from = self.exec_mode.get_label(),
                to = mode.get_label(),
                "execution mode change"
            );
            self.exec_mode = mode;
        }
    }

    pub fn current_dtxn(&self) -> Option<TxnId> {
        self.current_dtxn
    }

    pub fn is_halted(&self) -> bool {
        self.exec_mode == ExecMode::DisabledReject
    }

    /// Installs `txn_id` as the current dtxn. Fails when another dtxn already
    /// holds the partition; the caller must block the triggering message.
    pub fn install_dtxn(&mut self, txn_id: TxnId) -> bool {
        match self.current_dtxn {
            Some(current) if current != txn_id => false,
            _ => {
                if self.current_dtxn.is_none() {
                    debug!(
                        partition = self.partition,
                        txn_id = txn_id,
                        "installed distributed transaction"
                    );
                    self.current_dtxn = Some(txn_id);
                    if !self.is_halted() {
                        self.set_exec_mode(ExecMode::CommitReadOnly);
                    }
                }
                true
            },
        }
    }

    /// Clears the dtxn, resets the mode, and hands back everything that was
    /// waiting on it: blocked messages in arrival order.
    pub fn clear_dtxn(&mut self, txn_id: TxnId) -> VecDeque<InternalMessage> {
        assert_eq!(
            self.current_dtxn,
            Some(txn_id),
            "clearing a dtxn that is not current"
        );
        self.current_dtxn = None;
        self.spec_exec_modified = false;
        if !self.is_halted() {
            self.set_exec_mode(ExecMode::CommitAll);
        }
        std::mem::take(&mut self.blocked_messages)
    }

    pub fn block_message(&mut self, msg: InternalMessage) {
        trace!(
            partition = self.partition,
            message = msg.get_label(),
            "blocking message behind current dtxn"
        );
        self.blocked_messages.push_back(msg);
    }

    pub fn blocked_message_count(&self) -> usize {
        self.blocked_messages.len()
    }

    /// Buffers a speculative response until the dtxn resolves.
    pub fn push_blocked_response(&mut self, txn_id: TxnId, response: ClientResponse, wrote: bool) {
        self.spec_exec_blocked.push((txn_id, response));
        self.spec_exec_modified |= wrote;
    }

    /// Takes the speculative buffer, in dispatch order.
    pub fn take_blocked_responses(&mut self) -> Vec<(TxnId, ClientResponse)> {
        std::mem::take(&mut self.spec_exec_blocked)
    }

    pub fn blocked_response_count(&self) -> usize {
        self.spec_exec_blocked.len()
    }

    pub fn spec_exec_modified(&self) -> bool {
        self.spec_exec_modified
    }

    pub fn record_executed(&mut self, txn_id: TxnId) {
        self.last_executed_txn_id = Some(txn_id);
    }

    pub fn last_executed_txn_id(&self) -> Option<TxnId> {
        self.last_executed_txn_id
    }

    pub fn record_committed(&mut self, txn_id: TxnId) {
        if txn_id > self.last_committed_txn_id {
            self.last_committed_txn_id = txn_id;
        }
    }

    pub fn last_committed_txn_id(&self) -> TxnId {
        self.last_committed_txn_id
    }
}
