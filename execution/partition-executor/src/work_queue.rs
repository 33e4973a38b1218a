// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! The per-partition work queue: a thread-safe MPSC FIFO. Senders are
//! handed to peers, the coordinator, and the initializer; only the owning
//! executor polls.

use crate::{error::ExecutorError, message::InternalMessage};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

pub fn new_work_queue() -> (WorkQueueSender, WorkQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (WorkQueueSender { tx }, WorkQueue { rx })
}

#[derive(Clone, Debug)]
pub struct WorkQueueSender {
    tx: Sender<InternalMessage>,
}

impl WorkQueueSender {
    /// Enqueues a message for the owning executor. Fails only when the
    /// executor is gone.
    pub fn send(&self, msg: InternalMessage) -> Result<(), ExecutorError> {
        self.tx
            .send(msg)
            .map_err(|_| ExecutorError::QueueDisconnected)
    }

    pub fn try_send(&self, msg: InternalMessage) -> Result<(), ExecutorError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(ExecutorError::QueueDisconnected)
            },
        }
    }
}

#[derive(Debug)]
pub struct WorkQueue {
    rx: Receiver<InternalMessage>,
}

impl WorkQueue {
    /// Blocking poll bounded by `timeout`. `None` means the queue stayed
    /// empty, freeing the executor for utility work.
    pub fn poll(&self, timeout: Duration) -> Result<Option<InternalMessage>, ExecutorError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ExecutorError::QueueDisconnected),
        }
    }

    pub fn try_poll(&self) -> Option<InternalMessage> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True when a speculation scan should be abandoned: new work is waiting.
    pub fn interrupt_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}
