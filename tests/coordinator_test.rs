// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end coordinator scenarios against mock backends, plus the
//! coordinator's concurrency invariants (first-error-wins, cancellation
//! atomicity, progress monotonicity, liveness, idempotent cancel,
//! late-report absorption).

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gneiss::common::status::{Status, StatusCode};
use gneiss::common::types::UniqueId;
use gneiss::service::internal_service::InsertExecStatus;
use gneiss::Coordinator;

mod common;
use common::*;

fn query_id() -> UniqueId {
    UniqueId::new(0x1234, 0x100)
}

#[test]
fn request_without_root_fragment_or_sink_is_rejected() {
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Coordinator::new(env, query_id());

    let mut request = insert_request(&backend_hosts(2), 1);
    request.fragments[0].output_sink = None;
    request.finalize_params = None;

    let status = coordinator.exec(request);
    assert!(!status.is_ok());
    assert_eq!(client.num_exec_calls(), 0, "no RPCs may be issued");
}

#[test]
fn two_fragment_happy_path_returns_all_rows_and_aggregates() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![int_batch(4), int_batch(4), int_batch(4)]);
    let env = test_env(Arc::clone(&client), Some(Arc::clone(&executor)), MockFileSystem::new());
    let coordinator = Coordinator::new(env, query_id());

    assert!(coordinator.exec(select_request(&hosts, 4)).is_ok());
    assert_eq!(client.num_exec_calls(), 3);
    assert_eq!(coordinator.unique_hosts().len(), 4); // 3 backends + coordinator
    assert!(coordinator.row_desc().is_some());

    assert!(coordinator.wait().is_ok());

    let mut rows = 0;
    for _ in 0..3 {
        let batch = coordinator.get_next().unwrap().expect("a row batch");
        rows += batch.num_rows();
    }
    assert_eq!(rows, 12);

    // Workers finish: 4 ranges each, 1000 bytes/s throughput apiece.
    for (instance_id, backend_num, _) in client.dispatched_instances() {
        let mut params = report(query_id(), instance_id, backend_num, true, Status::ok());
        params.profile = Some(scan_profile(SCAN_NODE_ID, 4, 1000));
        assert!(coordinator.update_fragment_exec_status(params).is_ok());
    }

    assert!(coordinator.get_next().unwrap().is_none(), "end of stream");

    let progress = coordinator.progress().expect("progress after exec");
    assert_eq!(progress.completed(), 12);
    assert_eq!(progress.total(), 12);
    assert!(progress.done());

    assert_eq!(coordinator.compute_total_throughput(SCAN_NODE_ID), 3000);
    assert_eq!(coordinator.compute_total_scan_ranges_complete(SCAN_NODE_ID), 12);

    let profile_text = coordinator.query_profile().pretty_print();
    assert!(profile_text.contains("Averaged Fragment 1"));
    assert!(profile_text.contains("Fragment 1"));
    assert!(profile_text.contains("12 / 12 scan ranges"));
}

#[test]
fn remote_error_aborts_local_execution_and_cancels_others() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![int_batch(4)]);
    let env = test_env(Arc::clone(&client), Some(Arc::clone(&executor)), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(select_request(&hosts, 4)).is_ok());
    assert!(coordinator.wait().is_ok());

    let instances = client.dispatched_instances();
    let (failed_id, failed_num, _) = instances[2].clone();
    let mut params = report(
        query_id(),
        failed_id,
        failed_num,
        true,
        Status::io_error("disk read failed"),
    );
    params.error_log = vec!["scan of /data/h2/part-0 failed".to_string()];
    assert!(coordinator.update_fragment_exec_status(params).is_ok());

    let err = coordinator.get_next().expect_err("query must abort");
    assert_eq!(err.code(), StatusCode::IoError);
    assert!(executor.was_cancelled());

    env.cancel_pool().join();
    let cancelled = client.cancelled_instances();
    assert_eq!(cancelled.len(), 2, "only the two healthy backends get cancelled");
    assert!(cancelled.contains(&instances[0].0));
    assert!(cancelled.contains(&instances[1].0));
    assert!(!cancelled.contains(&failed_id));

    let wait_status = coordinator.wait();
    assert_eq!(wait_status.code(), StatusCode::IoError);

    let log = coordinator.get_error_log();
    assert!(log.contains("disk read failed"));
    assert!(log.contains("scan of /data/h2/part-0 failed"));
}

#[test]
fn dispatch_failure_cancels_started_instances() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    client.fail_exec_on("backend-1", Status::remote_error("connection refused"));
    let executor = MockExecutor::with_batches(vec![]);
    let env = test_env(Arc::clone(&client), Some(executor), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    let status = coordinator.exec(select_request(&hosts, 1));
    assert_eq!(status.code(), StatusCode::RemoteError);

    env.cancel_pool().join();
    let cancelled = client.cancelled_instances();
    let failed: Vec<UniqueId> = client
        .dispatched_instances()
        .iter()
        .filter(|(_, _, addr)| addr.hostname == "backend-1")
        .map(|(id, _, _)| *id)
        .collect();
    assert_eq!(cancelled.len(), 2);
    assert!(!cancelled.contains(&failed[0]), "failed instance never started");

    assert_eq!(coordinator.wait().code(), StatusCode::RemoteError);
}

#[test]
fn client_cancel_before_eos_cancels_everything() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![int_batch(1)]);
    let env = test_env(Arc::clone(&client), Some(Arc::clone(&executor)), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(select_request(&hosts, 1)).is_ok());
    assert!(coordinator.wait().is_ok());

    coordinator.cancel();
    assert!(executor.was_cancelled());

    let err = coordinator.get_next().expect_err("cancelled query yields no rows");
    assert!(err.is_cancelled());

    env.cancel_pool().join();
    assert_eq!(client.cancelled_instances().len(), 3);
    assert!(coordinator.wait().is_cancelled());
}

#[test]
fn client_cancel_after_eos_leaves_success_intact() {
    let hosts = backend_hosts(2);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![]);
    let env = test_env(Arc::clone(&client), Some(Arc::clone(&executor)), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(select_request(&hosts, 1)).is_ok());
    assert!(coordinator.wait().is_ok());

    for (instance_id, backend_num, _) in client.dispatched_instances() {
        let params = report(query_id(), instance_id, backend_num, true, Status::ok());
        assert!(coordinator.update_fragment_exec_status(params).is_ok());
    }
    assert!(coordinator.get_next().unwrap().is_none());

    // The race is already decided: the query succeeded.
    coordinator.cancel();
    assert!(coordinator.wait().is_ok());
    assert!(!executor.was_cancelled());
    env.cancel_pool().join();
    assert!(client.cancelled_instances().is_empty());
}

#[test]
fn distributed_insert_merges_side_effects_and_finalizes() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let fs = MockFileSystem::new();
    let env = test_env(Arc::clone(&client), None, Arc::clone(&fs));
    let coordinator = Coordinator::new(env, query_id());

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    assert_eq!(client.num_exec_calls(), 3);

    let per_backend: [(&[(&str, i64)], &[(&str, &str)]); 3] = [
        (&[("p=1", 10)], &[("/staging/f1", "/warehouse/f1")]),
        (&[("p=1", 5), ("p=2", 3)], &[("/staging/tmp", "")]),
        (&[("p=2", 7)], &[]),
    ];
    for ((instance_id, backend_num, _), (rows, moves)) in client
        .dispatched_instances()
        .into_iter()
        .zip(per_backend.iter())
    {
        let mut params = report(query_id(), instance_id, backend_num, true, Status::ok());
        params.insert_exec_status = Some(InsertExecStatus {
            partition_row_counts: rows
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            files_to_move: moves
                .iter()
                .map(|(s, d)| (s.to_string(), d.to_string()))
                .collect(),
        });
        assert!(coordinator.update_fragment_exec_status(params).is_ok());
    }

    assert!(coordinator.wait().is_ok());

    let expected: BTreeMap<String, i64> =
        BTreeMap::from([("p=1".to_string(), 15), ("p=2".to_string(), 10)]);
    assert_eq!(coordinator.partition_row_counts(), expected);

    let update = coordinator.prepare_catalog_update().expect("catalog update");
    assert_eq!(update.target_table, "target_table");
    assert_eq!(update.partition_row_counts, expected);

    assert_eq!(
        fs.moves(),
        vec![("/staging/f1".to_string(), "/warehouse/f1".to_string())]
    );
    assert_eq!(fs.deletes(), vec!["/staging/tmp".to_string()]);

    // get_next is safe without a root fragment: immediate end of stream.
    assert!(coordinator.get_next().unwrap().is_none());
}

#[test]
fn failed_file_move_becomes_the_terminal_status() {
    let hosts = backend_hosts(1);
    let client = MockBackendClient::new();
    let fs = MockFileSystem::new();
    fs.fail_moves_with(Status::io_error("rename failed"));
    let env = test_env(Arc::clone(&client), None, Arc::clone(&fs));
    let coordinator = Coordinator::new(env, query_id());

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());

    let (instance_id, backend_num, _) = client.dispatched_instances()[0].clone();
    let mut params = report(query_id(), instance_id, backend_num, true, Status::ok());
    params.insert_exec_status = Some(InsertExecStatus {
        partition_row_counts: BTreeMap::from([(String::new(), 4)]),
        files_to_move: BTreeMap::from([("/staging/f1".to_string(), "/warehouse/f1".to_string())]),
    });
    assert!(coordinator.update_fragment_exec_status(params).is_ok());

    let status = coordinator.wait();
    assert_eq!(status.code(), StatusCode::IoError);
    assert_eq!(coordinator.wait().code(), StatusCode::IoError);
}

#[test]
fn duplicate_done_report_decrements_remaining_once() {
    let hosts = backend_hosts(2);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Arc::new(Coordinator::new(env, query_id()));

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    let instances = client.dispatched_instances();

    // Backend 0 reports done twice; if the second report decremented the
    // remaining count again, wait() would return before backend 1 finishes.
    for _ in 0..2 {
        let params = report(query_id(), instances[0].0, instances[0].1, true, Status::ok());
        assert!(coordinator.update_fragment_exec_status(params).is_ok());
    }

    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(&coordinator);
    thread::spawn(move || {
        let _ = tx.send(waiter.wait());
    });
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "wait() must still block on backend 1"
    );

    let params = report(query_id(), instances[1].0, instances[1].1, true, Status::ok());
    assert!(coordinator.update_fragment_exec_status(params).is_ok());
    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("wait() finishes after the last backend");
    assert!(status.is_ok());
}

#[test]
fn first_error_wins_under_concurrent_reports_and_cancel() {
    let hosts = backend_hosts(4);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Arc::new(Coordinator::new(env, query_id()));

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    let instances = client.dispatched_instances();

    let mut handles = Vec::new();
    for (i, (instance_id, backend_num, _)) in instances.iter().take(3).cloned().enumerate() {
        let coordinator = Arc::clone(&coordinator);
        handles.push(thread::spawn(move || {
            let params = report(
                query_id(),
                instance_id,
                backend_num,
                true,
                Status::internal_error(format!("failure-{i}")),
            );
            coordinator.update_fragment_exec_status(params)
        }));
    }
    {
        let coordinator = Arc::clone(&coordinator);
        handles.push(thread::spawn(move || {
            coordinator.cancel();
            Status::ok()
        }));
    }
    for handle in handles {
        let _ = handle.join().unwrap();
    }

    let final_status = coordinator.wait();
    assert!(!final_status.is_ok());
    let message = final_status.message().unwrap_or("").to_string();
    let is_candidate = final_status.is_cancelled()
        || (final_status.code() == StatusCode::InternalError && message.starts_with("failure-"));
    assert!(is_candidate, "unexpected terminal status: {final_status}");

    // Any later error is subordinate to the first.
    let params = report(
        query_id(),
        instances[3].0,
        instances[3].1,
        true,
        Status::internal_error("straggler failure"),
    );
    let _ = coordinator.update_fragment_exec_status(params);
    assert_eq!(coordinator.wait(), final_status);
}

#[test]
fn cancellation_reaches_every_unfinished_backend() {
    let hosts = backend_hosts(5);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    coordinator.cancel();

    // Observing the non-OK status implies cancellation was initiated for
    // every backend that had not finished.
    assert!(coordinator.wait().is_cancelled());
    env.cancel_pool().join();
    let mut cancelled = client.cancelled_instances();
    cancelled.sort_by_key(|id| (id.hi, id.lo));
    cancelled.dedup();
    assert_eq!(cancelled.len(), 5);
}

#[test]
fn repeated_cancel_is_idempotent() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    for _ in 0..5 {
        coordinator.cancel();
    }

    assert!(coordinator.wait().is_cancelled());
    env.cancel_pool().join();
    assert_eq!(
        client.cancelled_instances().len(),
        3,
        "each backend is cancelled exactly once"
    );
}

#[test]
fn progress_is_monotone_and_never_exceeds_the_total() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![]);
    let env = test_env(Arc::clone(&client), Some(executor), MockFileSystem::new());
    let coordinator = Coordinator::new(env, query_id());

    assert!(coordinator.exec(select_request(&hosts, 4)).is_ok());
    let instances = client.dispatched_instances();
    let progress = coordinator.progress().expect("progress");
    assert_eq!(progress.total(), 12);

    let mut params = report(query_id(), instances[0].0, instances[0].1, false, Status::ok());
    params.profile = Some(scan_profile(SCAN_NODE_ID, 4, 100));
    assert!(coordinator.update_fragment_exec_status(params).is_ok());
    assert_eq!(progress.completed(), 4);

    // A report with a lower watermark must not move progress backwards.
    let mut params = report(query_id(), instances[0].0, instances[0].1, false, Status::ok());
    params.profile = Some(scan_profile(SCAN_NODE_ID, 2, 100));
    assert!(coordinator.update_fragment_exec_status(params).is_ok());
    assert_eq!(progress.completed(), 4);

    // An absurd watermark is clamped to the placement total.
    let mut params = report(query_id(), instances[1].0, instances[1].1, false, Status::ok());
    params.profile = Some(scan_profile(SCAN_NODE_ID, 1000, 100));
    assert!(coordinator.update_fragment_exec_status(params).is_ok());
    assert_eq!(progress.completed(), 12);
    assert!(progress.completed() <= progress.total());
}

#[test]
fn wait_returns_promptly_after_the_last_done_report() {
    let hosts = backend_hosts(3);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Arc::new(Coordinator::new(env, query_id()));

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    let instances = client.dispatched_instances();

    let reporter = Arc::clone(&coordinator);
    let status = assert_completes_within(Duration::from_secs(5), move || {
        let handle = {
            let coordinator = Arc::clone(&reporter);
            thread::spawn(move || coordinator.wait())
        };
        for (instance_id, backend_num, _) in instances {
            let params = report(query_id(), instance_id, backend_num, true, Status::ok());
            assert!(reporter.update_fragment_exec_status(params).is_ok());
        }
        handle.join().unwrap()
    });
    assert!(status.is_ok());
}

#[test]
fn late_report_for_done_backend_only_appends_to_the_error_log() {
    let hosts = backend_hosts(2);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_batches(vec![]);
    let env = test_env(Arc::clone(&client), Some(executor), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(select_request(&hosts, 4)).is_ok());
    let instances = client.dispatched_instances();

    let mut params = report(query_id(), instances[0].0, instances[0].1, true, Status::ok());
    params.profile = Some(scan_profile(SCAN_NODE_ID, 4, 1000));
    assert!(coordinator.update_fragment_exec_status(params).is_ok());

    // Late report: bigger counters, an error status, and a log line. Only
    // the log line may stick.
    let mut late = report(
        query_id(),
        instances[0].0,
        instances[0].1,
        true,
        Status::internal_error("late failure"),
    );
    late.profile = Some(scan_profile(SCAN_NODE_ID, 100, 9999));
    late.error_log = vec!["late warning".to_string()];
    assert!(coordinator.update_fragment_exec_status(late).is_ok());

    assert_eq!(coordinator.progress().unwrap().completed(), 4);
    assert_eq!(coordinator.compute_total_throughput(SCAN_NODE_ID), 1000);
    assert!(coordinator.wait().is_ok(), "late error must not abort the query");
    assert!(coordinator.get_error_log().contains("late warning"));
    env.cancel_pool().join();
    assert!(client.cancelled_instances().is_empty());
}

#[test]
fn report_for_unknown_instance_is_rejected() {
    let hosts = backend_hosts(2);
    let client = MockBackendClient::new();
    let env = test_env(Arc::clone(&client), None, MockFileSystem::new());
    let coordinator = Coordinator::new(env, query_id());

    assert!(coordinator.exec(insert_request(&hosts, 1)).is_ok());
    let params = report(
        query_id(),
        UniqueId::new(0xdead, 0xbeef),
        7,
        true,
        Status::ok(),
    );
    let status = coordinator.update_fragment_exec_status(params);
    assert!(!status.is_ok(), "stale report must be rejected");
}

#[test]
fn local_executor_error_funnels_into_the_query_status() {
    let hosts = backend_hosts(2);
    let client = MockBackendClient::new();
    let executor = MockExecutor::with_items(vec![
        Ok(int_batch(2)),
        Err(Status::internal_error("expr evaluation failed")),
    ]);
    let env = test_env(Arc::clone(&client), Some(Arc::clone(&executor)), MockFileSystem::new());
    let coordinator = Coordinator::new(Arc::clone(&env), query_id());

    assert!(coordinator.exec(select_request(&hosts, 1)).is_ok());
    assert!(coordinator.wait().is_ok());

    assert!(coordinator.get_next().unwrap().is_some());
    let err = coordinator.get_next().expect_err("executor error surfaces");
    assert_eq!(err.code(), StatusCode::InternalError);

    // The error triggered cancellation of all remote fragments.
    env.cancel_pool().join();
    assert_eq!(client.cancelled_instances().len(), 2);
    assert_eq!(coordinator.wait().code(), StatusCode::InternalError);
}
