// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! The speculative scheduler. While a distributed transaction holds the
//! partition, idle executor cycles are filled with queued single-partition
//! transactions that are provably safe to run under the dtxn's current local
//! state.

use crate::{
    conflicts::ConflictChecker,
    counters,
    estimator::ExecutionEstimator,
    lock_queue::LockQueue,
};
use kiln_config::{ExecutorConfig, SpeculationPolicy};
use kiln_logger::prelude::*;
use kiln_types::{
    transaction::{SpecType, TransactionState},
    PartitionId, TxnId,
};
use std::{collections::HashMap, sync::Arc};

/// Where the dtxn currently stands at this partition, and therefore which
/// candidates are safe. Stall-point types accept any single-partition
/// candidate; the mid-execution types consult the conflict checker.
pub fn compute_spec_type(dtxn: &TransactionState, partition: PartitionId) -> SpecType {
    let local = dtxn.base_partition == partition;
    let prepared = dtxn.is_prepared(partition);
    let executed_here = dtxn.executed_at(partition);

    if local {
        if prepared {
            SpecType::Sp3Local
        } else if executed_here {
            SpecType::Sp1Local
        } else {
            SpecType::Idle
        }
    } else if prepared {
        SpecType::Sp3Remote
    } else if executed_here {
        SpecType::Sp2RemoteAfter
    } else {
        SpecType::Sp2RemoteBefore
    }
}

/// Saved position of an unfinished scan. Reused across idle calls while the
/// dtxn, speculation type, and queue are unchanged (each sensitivity
/// configurable), so repeated polls do not rescan the same prefix.
#[derive(Clone, Copy, Debug)]
struct ScanCursor {
    dtxn_id: TxnId,
    spec_type: SpecType,
    queue_len: usize,
    resume_after: Option<TxnId>,
    /// The whole queue was scanned without a hit; nothing to do until the
    /// queue or the dtxn state changes.
    exhausted: bool,
}

pub struct SpeculativeScheduler {
    partition: PartitionId,
    policy: SpeculationPolicy,
    window: usize,
    rescan_on_queue_size_change: bool,
    rescan_on_dtxn_change: bool,
    checker: Box<dyn ConflictChecker>,
    estimator: Arc<dyn ExecutionEstimator>,
    cursor: Option<ScanCursor>,
}

impl SpeculativeScheduler {
    pub fn new(
        partition: PartitionId,
        config: &ExecutorConfig,
        checker: Box<dyn ConflictChecker>,
        estimator: Arc<dyn ExecutionEstimator>,
    ) -> Self {
        Self {
            partition,
            policy: config.speculation_policy,
            window: config.speculation_window,
            rescan_on_queue_size_change: config.rescan_on_queue_size_change,
            rescan_on_dtxn_change: config.rescan_on_dtxn_change,
            checker,
            estimator,
            cursor: None,
        }
    }

    /// Picks the next speculative candidate, removes it from the lock queue,
    /// and returns its id with the speculation type it runs under. The
    /// `interrupt` probe is checked between queue entries; a pending
    /// interrupt abandons the scan and discards the partial result.
    pub fn next_candidate(
        &mut self,
        dtxn: &TransactionState,
        spec_type: SpecType,
        queue: &mut LockQueue,
        arena: &HashMap<TxnId, TransactionState>,
        interrupt: impl Fn() -> bool,
    ) -> Option<TxnId> {
        if spec_type == SpecType::Idle || queue.is_empty() {
            return None;
        }
        counters::SPEC_SCANS.inc();

        self.revalidate_cursor(dtxn.id, spec_type, queue.len());
        if matches!(self.cursor, Some(c) if c.exhausted) {
            return None;
        }
        let resume_after = self.cursor.and_then(|c| c.resume_after);

        let mut scanned_through = resume_after;
        let mut best: Option<(TxnId, u64)> = None;
        let mut scanned = 0usize;

        let entries: Vec<(TxnId, bool)> = match resume_after {
            Some(after) => queue
                .iter_after(after)
                .map(|r| (r.txn_id, r.local && r.single_partition))
                .take(self.window)
                .collect(),
            None => queue
                .iter()
                .map(|r| (r.txn_id, r.local && r.single_partition))
                .take(self.window)
                .collect(),
        };

        for (txn_id, queue_eligible) in entries {
            if interrupt() {
                counters::SPEC_SCANS_INTERRUPTED.inc();
                trace!(
                    partition = self.partition,
                    "speculation scan interrupted by new work"
                );
                return None;
            }
            scanned += 1;
            scanned_through = Some(txn_id);

            if !queue_eligible {
                continue;
            }
            let candidate = match arena.get(&txn_id) {
                Some(t) => t,
                None => continue,
            };
            if candidate.executed_at(self.partition) {
                continue;
            }
            if !spec_type.is_stall_point()
                && !self.checker.can_speculate(dtxn, candidate, self.partition)
            {
                continue;
            }

            match self.policy {
                SpeculationPolicy::First => {
                    best = Some((txn_id, 0));
                    break;
                },
                SpeculationPolicy::Shortest | SpeculationPolicy::Longest => {
                    let estimate = self.estimator.remaining_us(&candidate.procedure);
                    let better = match (&best, self.policy) {
                        (None, _) => true,
                        (Some((_, b)), SpeculationPolicy::Shortest) => estimate < *b,
                        (Some((_, b)), SpeculationPolicy::Longest) => estimate > *b,
                        (Some(_), SpeculationPolicy::First) => unreachable!(),
                    };
                    if better {
                        best = Some((txn_id, estimate));
                    }
                },
            }
        }

        match best {
            Some((txn_id, _)) => {
                queue.remove(txn_id);
                // The queue changed; the next scan starts fresh.
                self.cursor = None;
                counters::SPECULATIVE_EXECUTIONS
                    .with_label_values(&[spec_type.get_label()])
                    .inc();
                debug!(
                    partition = self.partition,
                    txn_id = txn_id,
                    spec_type = spec_type.get_label(),
                    "released speculative candidate"
                );
                Some(txn_id)
            },
            None => {
                let exhausted = scanned < self.window
                    || queue
                        .iter_after(scanned_through.unwrap_or(0))
                        .next()
                        .is_none();
                self.cursor = Some(ScanCursor {
                    dtxn_id: dtxn.id,
                    spec_type,
                    queue_len: queue.len(),
                    resume_after: scanned_through,
                    exhausted,
                });
                None
            },
        }
    }

    fn revalidate_cursor(&mut self, dtxn_id: TxnId, spec_type: SpecType, queue_len: usize) {
        if let Some(cursor) = self.cursor {
            let dtxn_changed = cursor.dtxn_id != dtxn_id || cursor.spec_type != spec_type;
            let queue_changed = cursor.queue_len != queue_len;
            if (self.rescan_on_dtxn_change && dtxn_changed)
                || (self.rescan_on_queue_size_change && queue_changed)
            {
                self.cursor = None;
            }
        }
    }
}
