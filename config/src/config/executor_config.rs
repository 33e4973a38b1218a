// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// How the speculative scheduler picks among non-conflicting candidates in
/// its scan window.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationPolicy {
    /// First non-conflicting candidate in queue order (cheapest scan).
    First,
    /// Minimum estimated remaining execution time in the window.
    Shortest,
    /// Maximum estimated remaining execution time in the window.
    Longest,
}

/// Which conflict checker guards the mid-execution speculation types.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCheckerKind {
    /// Table-footprint checking against the procedure catalog.
    Table,
    /// Refuse every candidate outside stall points. For catalogs whose
    /// declared footprints cannot be trusted.
    Pessimistic,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Bound on one blocking work-queue poll, in microseconds.
    pub work_queue_poll_us: u64,
    /// Minimum interval between storage-engine ticks, in milliseconds.
    pub tick_interval_ms: u64,
    pub speculative_execution_enabled: bool,
    pub speculation_policy: SpeculationPolicy,
    pub conflict_checker: ConflictCheckerKind,
    /// How far into the lock queue a speculative scan looks.
    pub speculation_window: usize,
    /// Invalidate the cached scan position when the lock queue size changes.
    pub rescan_on_queue_size_change: bool,
    /// Invalidate the cached scan position when the dtxn or its speculation
    /// type changes.
    pub rescan_on_dtxn_change: bool,
    /// Always allocate a fresh undo token for write rounds, disabling the
    /// estimator-driven no-logging fast path.
    pub force_undo_logging: bool,
    /// How long the fragment dispatcher waits for remote dependencies before
    /// declaring the cluster unhealthy, in milliseconds.
    pub response_timeout_ms: u64,
    /// Restarts (mispredict or speculative) after which a transaction is
    /// surfaced to the client as an unexpected abort instead of re-queued.
    pub max_restarts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> ExecutorConfig {
        ExecutorConfig {
            work_queue_poll_us: 10,
            tick_interval_ms: 1_000,
            speculative_execution_enabled: true,
            speculation_policy: SpeculationPolicy::First,
            conflict_checker: ConflictCheckerKind::Table,
            speculation_window: 10,
            rescan_on_queue_size_change: true,
            rescan_on_dtxn_change: true,
            force_undo_logging: false,
            response_timeout_ms: 10_000,
            max_restarts: 5,
        }
    }
}
