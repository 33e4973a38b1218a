// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

use kiln_metrics_core::{
    exponential_buckets, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};
use once_cell::sync::Lazy;

pub static TRANSACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kiln_executor_transactions_total",
        "Transactions finished at this site, by terminal status.",
        &["status"],
    )
    .unwrap()
});

pub static SPECULATIVE_EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kiln_executor_speculative_executions_total",
        "Transactions dispatched speculatively, by speculation type.",
        &["spec_type"],
    )
    .unwrap()
});

pub static SPEC_SCANS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kiln_executor_speculation_scans_total",
        "Lock-queue scans performed by the speculative scheduler.",
    )
    .unwrap()
});

pub static SPEC_SCANS_INTERRUPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kiln_executor_speculation_scans_interrupted_total",
        "Speculation scans abandoned because new work arrived.",
    )
    .unwrap()
});

pub static DTXN_FINISHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kiln_executor_dtxn_finishes_total",
        "Distributed transaction finishes, by local outcome.",
        &["outcome"],
    )
    .unwrap()
});

pub static WORK_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kiln_executor_work_queue_depth",
        "Messages waiting in the partition work queue.",
        &["partition"],
    )
    .unwrap()
});

pub static LOCK_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kiln_executor_lock_queue_depth",
        "Transactions waiting on the partition lock.",
        &["partition"],
    )
    .unwrap()
});

pub static BLOCKED_RESPONSES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kiln_executor_blocked_responses",
        "Speculative responses buffered until the current dtxn resolves.",
        &["partition"],
    )
    .unwrap()
});

pub static PROCEDURE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "kiln_executor_procedure_seconds",
        "Stored procedure execution time.",
        &["procedure"],
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 22).unwrap(),
    )
    .unwrap()
});
