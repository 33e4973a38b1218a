// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios for the partition executor: speculative windows,
//! cascading commit/abort, misprediction restart, dtxn serialization, and
//! halt, all driven through real work queues against mock storage engines.

mod common;

use bytes::Bytes;
use common::*;
use kiln_storage_interface::mock::EngineCall;
use kiln_types::{message::WorkFragment, Status};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn work_fragment(partition: u32, fragment_id: u32, read_only: bool) -> WorkFragment {
    WorkFragment {
        partition_id: partition,
        fragment_ids: vec![fragment_id],
        param_indices: vec![],
        input_dep_ids: vec![],
        output_dep_ids: vec![200],
        read_only,
        last_fragment: false,
        prefetch: false,
        needs_input: false,
        future_statements: vec![],
    }
}

#[test]
fn test_pure_single_partition_stream() {
    let harness = start_site(vec![0], 1);

    let receivers: Vec<_> = (0..1000)
        .map(|_| harness.submit("WriteA", Bytes::new(), 0, &[], false))
        .collect();
    for rx in receivers {
        let response = recv_response(rx, WAIT);
        assert_eq!(response.status, Status::Ok);
    }

    let engine = harness.engine(0);
    let released = engine.released_tokens();
    assert_eq!(released.len(), 1000);
    assert!(released.windows(2).all(|w| w[0] < w[1]));
    assert!(engine.undone_tokens().is_empty());
    assert_eq!(harness.coordinator.crash_count(), 0);

    harness.site.shutdown();
}

#[test]
fn test_dtxn_commit_releases_speculative_reads() {
    let harness = start_site(vec![0, 1], 2);
    harness.coordinator.hold_remote_work();

    // D: writes locally at partition 0 and at remote partition 4 (site 2).
    // The held remote work keeps D parked on its dispatch latch.
    let d_rx = harness.submit("Transfer", transfer_params(&[0, 4]), 0, &[0, 4], false);
    wait_until(WAIT, || harness.coordinator.held_work_count() == 1);

    // Three read-only single-partition txns arrive while D holds the
    // partition; they run speculatively and their responses buffer (D has
    // written locally, so the mode blocks even read-only releases).
    let spec_rx: Vec<_> = (0..3)
        .map(|_| harness.submit("ReadB", Bytes::new(), 0, &[], true))
        .collect();
    wait_until(WAIT, || {
        harness
            .engine(0)
            .executions()
            .iter()
            .filter(|e| e.fragment_ids == vec![READ_B_FRAGMENT])
            .count()
            == 3
    });
    assert!(harness.engine(0).released_tokens().is_empty());

    // D's remote dependency arrives; D commits through 2PC and the window
    // resolves.
    harness.coordinator.release_remote_work();
    for rx in spec_rx {
        assert_eq!(recv_response(rx, WAIT).status, Status::Ok);
    }
    assert_eq!(recv_response(d_rx, WAIT).status, Status::Ok);

    // One release covers D plus all three speculative reads: a single
    // superset token commit, no per-txn releases.
    let engine = harness.engine(0);
    assert_eq!(engine.released_tokens().len(), 1);
    assert!(engine.undone_tokens().is_empty());

    // D executed locally before the speculative reads.
    let executions = engine.executions();
    assert_eq!(executions[0].fragment_ids, vec![TRANSFER_FRAGMENT]);

    harness.site.shutdown();
}

#[test]
fn test_dtxn_abort_cascades_by_undo_token() {
    let harness = start_site_with_ids(vec![0], 1, 2);
    let engine = harness.engine(0).clone();

    // Remote dtxn D (id 1, base partition 5) takes the partition lock.
    let granted = harness
        .site
        .queue_set_partition_lock(0, 1, 5, "WriteA", Bytes::new())
        .expect("lock request");
    assert_eq!(futures::executor::block_on(granted).unwrap(), 0);

    // s1 speculates before D does any local work: its token precedes D's.
    let mut s1_rx = harness.submit("WriteB", Bytes::new(), 0, &[], false);
    wait_until(WAIT, || {
        engine
            .executions()
            .iter()
            .any(|e| e.fragment_ids == vec![WRITE_B_FRAGMENT])
    });
    assert!(try_recv_response(&mut s1_rx).is_none());

    // D writes at this partition.
    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    harness
        .site
        .queue_work(
            0,
            1,
            5,
            "WriteA",
            vec![],
            work_fragment(0, WRITE_A_FRAGMENT, false),
            reply_tx,
        )
        .expect("queue dtxn work");
    let d_result = reply_rx.recv_timeout(WAIT).expect("dtxn work result");
    assert_eq!(d_result.status, Status::Ok);

    // s2 and s3 speculate on top of D's write: their tokens follow D's.
    let s2_rx = harness.submit("WriteB", Bytes::new(), 0, &[], false);
    let s3_rx = harness.submit("WriteB", Bytes::new(), 0, &[], false);
    wait_until(WAIT, || {
        engine
            .executions()
            .iter()
            .filter(|e| e.fragment_ids == vec![WRITE_B_FRAGMENT])
            .count()
            == 3
    });

    // D aborts. s1 commits (its effects predate D's first write); s2 and s3
    // restart transparently and eventually succeed.
    harness
        .site
        .queue_finish(0, 1, Status::AbortUser)
        .expect("finish dtxn");

    assert_eq!(recv_response(s1_rx, WAIT).status, Status::Ok);
    assert_eq!(recv_response(s2_rx, WAIT).status, Status::Ok);
    assert_eq!(recv_response(s3_rx, WAIT).status, Status::Ok);

    // Engine-visible order: commit strictly below D's first write, then the
    // rollback at D's token, then the restarted attempts' commits.
    let executions = engine.executions();
    let s1_token = executions
        .iter()
        .find(|e| e.fragment_ids == vec![WRITE_B_FRAGMENT])
        .expect("s1 execution")
        .undo_token;
    let d_token = executions
        .iter()
        .find(|e| e.fragment_ids == vec![WRITE_A_FRAGMENT])
        .expect("dtxn execution")
        .undo_token;
    assert!(s1_token < d_token);

    let calls = engine.calls();
    let release_idx = calls
        .iter()
        .position(|c| *c == EngineCall::Release(s1_token))
        .expect("speculative commit below the dtxn");
    let undo_idx = calls
        .iter()
        .position(|c| *c == EngineCall::Undo(d_token))
        .expect("dtxn rollback");
    assert!(release_idx < undo_idx);

    // s2/s3 were re-executed after the cascade: five WriteB rounds total.
    assert_eq!(
        engine
            .executions()
            .iter()
            .filter(|e| e.fragment_ids == vec![WRITE_B_FRAGMENT])
            .count(),
        5
    );
    assert_eq!(harness.coordinator.crash_count(), 0);

    harness.site.shutdown();
}

#[test]
fn test_misprediction_restarts_as_multi_partition() {
    let harness = start_site(vec![0, 1], 2);

    // Predicted single-partition on 0, but the procedure touches 1.
    let rx = harness.submit("Transfer", transfer_params(&[0, 1]), 0, &[], false);
    let response = recv_response(rx, WAIT);
    assert_eq!(response.status, Status::Ok);

    // The mispredicted attempt was caught before any engine work: exactly
    // one execution round per partition, and nothing rolled back.
    let p0 = harness.engine(0);
    assert_eq!(
        p0.executions()
            .iter()
            .filter(|e| e.fragment_ids == vec![TRANSFER_FRAGMENT])
            .count(),
        1
    );
    assert!(p0.undone_tokens().is_empty());
    assert_eq!(
        harness
            .engine(1)
            .executions()
            .iter()
            .filter(|e| e.fragment_ids == vec![TRANSFER_FRAGMENT])
            .count(),
        1
    );

    harness.site.shutdown();
}

#[test]
fn test_second_dtxn_blocks_until_first_finishes() {
    let harness = start_site_with_ids(vec![0], 1, 10);
    let engine = harness.engine(0).clone();

    // D1 (id 1) takes the lock and runs one fragment.
    let granted = harness
        .site
        .queue_set_partition_lock(0, 1, 5, "WriteA", Bytes::new())
        .expect("lock request");
    let _ = futures::executor::block_on(granted);
    let (d1_tx, d1_rx) = crossbeam_channel::unbounded();
    harness
        .site
        .queue_work(0, 1, 5, "WriteA", vec![], work_fragment(0, WRITE_A_FRAGMENT, false), d1_tx)
        .expect("queue d1 work");
    assert_eq!(d1_rx.recv_timeout(WAIT).unwrap().status, Status::Ok);

    // A work fragment for D2 (id 2) arrives while D1 holds the partition:
    // it must wait on the blocked-message queue.
    let (d2_tx, d2_rx) = crossbeam_channel::unbounded();
    harness
        .site
        .queue_work(0, 2, 6, "WriteB", vec![], work_fragment(0, WRITE_B_FRAGMENT, false), d2_tx)
        .expect("queue d2 work");
    std::thread::sleep(Duration::from_millis(50));
    assert!(d2_rx.try_recv().is_err(), "D2 ran while D1 held the lock");

    // Finishing D1 replays the blocked message; D2 installs and runs.
    harness
        .site
        .queue_finish(0, 1, Status::Ok)
        .expect("finish d1");
    assert_eq!(d2_rx.recv_timeout(WAIT).unwrap().status, Status::Ok);
    harness
        .site
        .queue_finish(0, 2, Status::Ok)
        .expect("finish d2");

    wait_until(WAIT, || engine.released_tokens().len() == 2);
    harness.site.shutdown();
}

#[test]
fn test_pessimistic_checker_blocks_mid_execution_speculation() {
    let config = kiln_config::ExecutorConfig {
        conflict_checker: kiln_config::ConflictCheckerKind::Pessimistic,
        ..kiln_config::ExecutorConfig::default()
    };
    let harness = start_site_with_config(vec![0], 1, 2, config);
    let engine = harness.engine(0).clone();

    // Remote dtxn D executes a write here, putting the partition past its
    // stall point.
    let granted = harness
        .site
        .queue_set_partition_lock(0, 1, 5, "WriteA", Bytes::new())
        .expect("lock request");
    assert_eq!(futures::executor::block_on(granted).unwrap(), 0);
    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    harness
        .site
        .queue_work(0, 1, 5, "WriteA", vec![], work_fragment(0, WRITE_A_FRAGMENT, false), reply_tx)
        .expect("queue dtxn work");
    assert_eq!(reply_rx.recv_timeout(WAIT).unwrap().status, Status::Ok);

    // WriteB is disjoint from WriteA, so the table checker would speculate
    // it; the pessimistic checker must keep it queued until D resolves.
    let s_rx = harness.submit("WriteB", Bytes::new(), 0, &[], false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!engine
        .executions()
        .iter()
        .any(|e| e.fragment_ids == vec![WRITE_B_FRAGMENT]));

    harness
        .site
        .queue_finish(0, 1, Status::Ok)
        .expect("finish dtxn");
    assert_eq!(recv_response(s_rx, WAIT).status, Status::Ok);

    harness.site.shutdown();
}

#[test]
fn test_halt_rejects_new_transactions() {
    let harness = start_site(vec![0], 1);

    assert_eq!(
        recv_response(harness.submit("@Halt", Bytes::new(), 0, &[], false), WAIT).status,
        Status::Ok
    );

    // Non-sysproc work is rejected without touching the engine.
    let executions_before = harness.engine(0).executions().len();
    let response = recv_response(harness.submit("WriteA", Bytes::new(), 0, &[], false), WAIT);
    assert_eq!(response.status, Status::AbortReject);
    assert_eq!(harness.engine(0).executions().len(), executions_before);

    // Finishes are still processed while halted.
    harness
        .site
        .queue_finish(0, 999, Status::AbortUser)
        .expect("finish while halted");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(harness.coordinator.crash_count(), 0);

    harness.site.shutdown();
}

#[test]
fn test_user_abort_rolls_back_and_responds() {
    let harness = start_site(vec![0], 1);

    let response = recv_response(harness.submit("AbortA", Bytes::new(), 0, &[], false), WAIT);
    assert_eq!(response.status, Status::AbortUser);
    assert!(response.error.unwrap().contains("insufficient funds"));

    let engine = harness.engine(0);
    assert_eq!(engine.undone_tokens().len(), 1);
    assert!(engine.released_tokens().is_empty());

    harness.site.shutdown();
}

#[test]
fn test_prepare_is_idempotent() {
    let harness = start_site_with_ids(vec![0], 1, 10);
    let engine = harness.engine(0).clone();

    let granted = harness
        .site
        .queue_set_partition_lock(0, 1, 5, "WriteA", Bytes::new())
        .expect("lock request");
    let _ = futures::executor::block_on(granted);
    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    harness
        .site
        .queue_work(0, 1, 5, "WriteA", vec![], work_fragment(0, WRITE_A_FRAGMENT, false), reply_tx)
        .expect("queue work");
    assert_eq!(reply_rx.recv_timeout(WAIT).unwrap().status, Status::Ok);

    // Both prepares are acked with the partition id; the second is a no-op.
    let first = harness.site.queue_prepare(0, 1).expect("first prepare");
    assert_eq!(futures::executor::block_on(first).unwrap(), 0);
    let second = harness.site.queue_prepare(0, 1).expect("second prepare");
    assert_eq!(futures::executor::block_on(second).unwrap(), 0);

    harness.site.queue_finish(0, 1, Status::Ok).expect("finish");
    wait_until(WAIT, || engine.released_tokens().len() == 1);

    harness.site.shutdown();
}
