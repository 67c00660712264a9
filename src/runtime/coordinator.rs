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
//! Query coordinator: executes plan fragments on remote backends for one
//! query, runs the root fragment locally, and implements all client
//! requests against the running query, including cancellation.
//!
//! A typical call sequence (calls under the same number may run
//! concurrently):
//! 1. client: `exec()`
//! 2. client: `wait()` / client: `cancel()` / backend: `update_fragment_exec_status()`
//! 3. client: `get_next()`* / client: `cancel()` / backend: `update_fragment_exec_status()`
//!
//! Setting the overall error status and initiating cancellation of the
//! local and all remote fragments is atomic: both happen under the
//! coordinator lock, in `update_status`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Instant;

use threadpool::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::common::config;
use crate::common::ids::{FragmentIdx, PlanNodeId};
use crate::common::stats::SummaryStats;
use crate::common::status::{Result, Status};
use crate::common::types::{NetworkAddress, UniqueId};
use crate::plan::{FinalizeParams, QueryExecRequest};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::executor::{FragmentExecutor, RecordBatch, SchemaRef};
use crate::runtime::placement::{
    self, FragmentExecParams, FragmentScanRangeAssignment, QuerySchedule,
};
use crate::runtime::profile::{clamp_u128_to_i64, CounterUnit, RuntimeProfile};
use crate::runtime::progress::ProgressUpdater;
use crate::service::internal_service::{
    BackendClient, ExecPlanFragmentParams, PlanFragmentExecParams, ReportExecStatusParams,
};

/// Per-scan-node throughput counter reported by workers, bytes/s.
pub const THROUGHPUT_COUNTER: &str = "ThroughputCounter";
/// Per-scan-node count of finished scan ranges reported by workers.
pub const SCAN_RANGES_COMPLETE_COUNTER: &str = "ScanRangesComplete";

/// Catalog changes a finished DML query requires, consumed by the external
/// catalog service.
#[derive(Clone, Debug)]
pub struct CatalogUpdate {
    pub target_table: String,
    /// Partitions written to and the rows added to each; the empty string
    /// denotes the unpartitioned table itself.
    pub partition_row_counts: BTreeMap<String, i64>,
}

/// Execution state of one remotely dispatched fragment instance.
pub struct BackendExecState {
    backend_num: i32,
    fragment_idx: FragmentIdx,
    fragment_instance_id: UniqueId,
    address: NetworkAddress,
    total_split_bytes: i64,
    rpc_params: ExecPlanFragmentParams,
    start: Instant,
    state: Mutex<BackendExecInner>,
}

#[derive(Default)]
struct BackendExecInner {
    /// Start-fragment RPC has been issued (successfully or not).
    initiated: bool,
    /// Terminal: further reports are treated as duplicates.
    done: bool,
    /// Most recent status: the dispatch RPC result, then whatever the
    /// latest report carried.
    status: Status,
    profile: Option<RuntimeProfile>,
    error_log: Vec<String>,
    /// Watermark of completed scan ranges, for progress deltas.
    scan_ranges_complete: i64,
}

impl BackendExecState {
    pub fn backend_num(&self) -> i32 {
        self.backend_num
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }
}

/// Per-fragment aggregates, updated as instances finish and read at
/// summary time.
struct PerFragmentProfileData {
    num_instances: usize,
    bytes_assigned: Mutex<SummaryStats>,
    completion_times: Mutex<SummaryStats>,
    rates: Mutex<SummaryStats>,
}

impl PerFragmentProfileData {
    fn new(num_instances: usize) -> Self {
        Self {
            num_instances,
            bytes_assigned: Mutex::new(SummaryStats::new()),
            completion_times: Mutex::new(SummaryStats::new()),
            rates: Mutex::new(SummaryStats::new()),
        }
    }
}

/// Everything `exec()` establishes exactly once; read-only afterwards.
struct ExecContext {
    executor: Option<Arc<dyn FragmentExecutor>>,
    row_desc: Option<SchemaRef>,
    progress: ProgressUpdater,
    needs_finalization: bool,
    finalize_params: Option<FinalizeParams>,
    unique_hosts: HashSet<NetworkAddress>,
    fragment_profiles: Vec<PerFragmentProfileData>,
    scan_node_ids: Vec<PlanNodeId>,
}

/// Fields guarded by the coordinator lock. Critical sections stay short;
/// no network I/O happens while this is held.
#[derive(Default)]
struct CoordState {
    /// Overall query status: the first reported error, or CANCELLED.
    query_status: Status,
    /// Set once the client has received the last result row (or, for a
    /// DML query, once it completed). Errors arriving afterwards are
    /// teardown noise and do not flip the status.
    returned_all_results: bool,
    /// Backends with done != true. Hitting 0 wakes any waiting thread.
    num_remaining_backends: usize,
    partition_row_counts: BTreeMap<String, i64>,
    /// (src, dest) moves to apply at finalization; empty dest = delete.
    files_to_move: BTreeMap<String, String>,
    backend_states: Vec<Arc<BackendExecState>>,
    backend_state_map: HashMap<UniqueId, Arc<BackendExecState>>,
}

pub struct Coordinator {
    exec_env: Arc<ExecEnv>,
    query_id: UniqueId,
    exec_ctx: OnceLock<ExecContext>,
    /// Single-flights `wait()`. Held only to test-and-set the flag, never
    /// while acquiring `lock`.
    wait_flag: Mutex<bool>,
    lock: Mutex<CoordState>,
    /// Tied to `lock`; signalled when the last backend finishes or the
    /// query turns non-OK. Waiters re-check the predicate after wake-up.
    backend_completion_cv: Condvar,
}

impl Coordinator {
    pub fn new(exec_env: Arc<ExecEnv>, query_id: UniqueId) -> Self {
        Self {
            exec_env,
            query_id,
            exec_ctx: OnceLock::new(),
            wait_flag: Mutex::new(false),
            lock: Mutex::new(CoordState::default()),
            backend_completion_cv: Condvar::new(),
        }
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    /// Initiates asynchronous execution: runs placement, starts the local
    /// root executor, and dispatches all remote fragment instances in
    /// parallel. Returns once every instance has started (or failed to).
    /// Must precede all other calls.
    pub fn exec(&self, request: QueryExecRequest) -> Status {
        if self.exec_ctx.get().is_some() {
            return Status::internal_error("exec() already called for this coordinator");
        }
        if request.fragments.is_empty()
            || (!request.has_root_fragment && !request.has_table_sink())
        {
            return self.update_status(
                Status::internal_error(
                    "query exec request needs a root fragment or a data sink",
                ),
                None,
            );
        }

        info!(
            query_id = %self.query_id,
            fragments = request.fragments.len(),
            "starting query execution"
        );

        let coord_addr = self.exec_env.coord_address().clone();
        let schedule = match placement::compute_query_schedule(
            &request,
            self.query_id,
            &coord_addr,
            self.exec_env.scheduler().as_ref(),
        ) {
            Ok(schedule) => schedule,
            Err(e) => return self.update_status(e, None),
        };

        // The local root executor is prepared before any remote dispatch so
        // its row descriptor is available as soon as exec() returns.
        let mut executor = None;
        let mut row_desc = None;
        if request.has_root_fragment {
            let params = build_exec_params(
                &request,
                self.query_id,
                0,
                0,
                &schedule.fragment_exec_params[0],
                &schedule.scan_range_assignment[0],
                &coord_addr,
                -1,
            );
            match self.exec_env.executor_factory().create(&params) {
                Ok(exec) => {
                    row_desc = Some(exec.row_desc());
                    executor = Some(exec);
                }
                Err(e) => return self.update_status(e, None),
            }
        }

        let mut scan_node_ids = Vec::new();
        for fragment in &request.fragments {
            fragment.plan.collect_scan_node_ids(&mut scan_node_ids);
        }

        let fragment_profiles: Vec<PerFragmentProfileData> = schedule
            .fragment_exec_params
            .iter()
            .map(|fp| PerFragmentProfileData::new(fp.num_instances()))
            .collect();

        let states = self.create_backend_states(&request, &schedule, &coord_addr, &fragment_profiles);
        {
            let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.num_remaining_backends = states.len();
            guard.backend_state_map = states
                .iter()
                .map(|s| (s.fragment_instance_id, Arc::clone(s)))
                .collect();
            guard.backend_states = states.clone();
        }

        let ctx = ExecContext {
            executor,
            row_desc,
            progress: ProgressUpdater::new(
                format!("Query {}", self.query_id),
                schedule.num_scan_ranges,
            ),
            needs_finalization: request.finalize_params.is_some(),
            finalize_params: request.finalize_params.clone(),
            unique_hosts: schedule.unique_hosts.clone(),
            fragment_profiles,
            scan_node_ids,
        };
        if self.exec_ctx.set(ctx).is_err() {
            return Status::internal_error("exec() already called for this coordinator");
        }

        self.log_backend_info(&states);

        // Start-fragment RPCs go out in parallel, one worker per instance.
        if !states.is_empty() {
            let pool_size = config::dispatch_threads().min(states.len()).max(1);
            let pool = ThreadPool::with_name("coordinator dispatch".to_string(), pool_size);
            for state in &states {
                let state = Arc::clone(state);
                let client = Arc::clone(self.exec_env.backend_client());
                pool.execute(move || exec_remote_fragment(client, state));
            }
            pool.join();
        }

        // Account for dispatch failures: those instances never report, so
        // they are finished here. Instances whose first report already
        // arrived (done set) are left alone.
        let mut num_failed = 0;
        let mut first_error: Option<(Status, UniqueId)> = None;
        for state in &states {
            let mut inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.status.is_ok() && !inner.done {
                inner.done = true;
                num_failed += 1;
                if first_error.is_none() {
                    first_error = Some((inner.status.clone(), state.fragment_instance_id));
                }
            }
        }
        if num_failed > 0 {
            let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.num_remaining_backends = guard.num_remaining_backends.saturating_sub(num_failed);
            if guard.num_remaining_backends == 0 {
                self.backend_completion_cv.notify_all();
            }
        }
        if let Some((status, instance_id)) = first_error {
            return self.update_status(status, Some(instance_id));
        }

        // A cancellation that raced dispatch may have skipped instances
        // whose start RPC had not been issued yet; sweep again now that
        // every dispatch worker has returned.
        let status = self.get_status();
        if !status.is_ok() {
            let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.cancel_remote_fragments(&mut guard);
            return status;
        }

        debug!(
            query_id = %self.query_id,
            backends = states.len(),
            scan_ranges = self.exec_ctx.get().map(|c| c.progress.total()).unwrap_or(0),
            "all remote fragments started"
        );
        Status::ok()
    }

    /// Blocks until result rows are ready to be retrieved via `get_next`,
    /// or, for a query without a root fragment, until the query finishes.
    /// Idempotent; later calls return the current query status.
    pub fn wait(&self) -> Status {
        {
            let mut called = self.wait_flag.lock().unwrap_or_else(|e| e.into_inner());
            if *called {
                return self.get_status();
            }
            *called = true;
        }

        let Some(ctx) = self.exec_ctx.get() else {
            return Status::internal_error("wait() called before exec()");
        };

        let status = match &ctx.executor {
            Some(executor) => {
                // Open may block until rows are ready; remote backends keep
                // producing in the background.
                let open_status = executor.open();
                if open_status.is_ok() {
                    self.get_status()
                } else {
                    self.update_status(open_status, Some(self.query_id))
                }
            }
            None => {
                // Distributed INSERT: completion arrives via reports only.
                let status = self.wait_for_all_backends();
                if status.is_ok() && ctx.needs_finalization {
                    self.finalize_query()
                } else {
                    status
                }
            }
        };

        if status.is_ok() && ctx.executor.is_none() {
            // The query succeeded from the client's viewpoint; errors that
            // trickle in during teardown no longer matter.
            {
                let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                guard.returned_all_results = true;
            }
            self.report_query_summary();
        }
        status
    }

    /// Returns the next batch of result rows, or `Ok(None)` once execution
    /// has completed. Not re-entrant; all other operations may run
    /// concurrently with it. The returned batch is only valid until the
    /// next call.
    pub fn get_next(&self) -> Result<Option<RecordBatch>> {
        let Some(ctx) = self.exec_ctx.get() else {
            return Err(Status::internal_error("get_next() called before exec()"));
        };

        let Some(executor) = &ctx.executor else {
            // No local fragment: end of stream once every backend is done.
            let status = self.wait_for_all_backends();
            {
                let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                guard.returned_all_results = true;
            }
            status.into_result()?;
            return Ok(None);
        };

        match executor.get_next() {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => {
                {
                    let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                    guard.returned_all_results = true;
                }
                // Final profiles and INSERT side effects arrive with the
                // last reports; collect them before surfacing end of stream.
                self.wait_for_all_backends().into_result()?;
                if ctx.needs_finalization {
                    self.finalize_query().into_result()?;
                }
                self.report_query_summary();
                Ok(None)
            }
            Err(status) => {
                let effective = self.update_status(status.clone(), Some(self.query_id));
                if effective.is_ok() {
                    Err(status)
                } else {
                    Err(effective)
                }
            }
        }
    }

    /// Cancels the query: the local fragment and all remote fragments.
    /// Idempotent and safe in any state after `exec()`.
    pub fn cancel(&self) {
        let _ = self.update_status(Status::cancelled("Cancelled"), None);
    }

    /// Ingests a status report pushed by a remote worker. Reports for the
    /// same instance never arrive concurrently (caller contract). A report
    /// for an instance that is already done only appends to its error log.
    pub fn update_fragment_exec_status(&self, params: ReportExecStatusParams) -> Status {
        let Some(ctx) = self.exec_ctx.get() else {
            return Status::internal_error("status report received before exec()");
        };

        let state = {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            match guard.backend_state_map.get(&params.fragment_instance_id) {
                Some(state) => Arc::clone(state),
                None => {
                    return Status::internal_error(format!(
                        "unknown fragment instance id {} in status report",
                        params.fragment_instance_id
                    ));
                }
            }
        };

        let mut became_done = false;
        let mut progress_delta = 0;
        {
            let mut inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
            if inner.done {
                inner.error_log.extend(params.error_log.iter().cloned());
                return Status::ok();
            }
            if let Some(profile) = &params.profile {
                let complete = profile.sum_counter_values(SCAN_RANGES_COMPLETE_COUNTER);
                if complete > inner.scan_ranges_complete {
                    progress_delta = complete - inner.scan_ranges_complete;
                    inner.scan_ranges_complete = complete;
                }
                inner.profile = Some(profile.clone());
            }
            inner.error_log.extend(params.error_log.iter().cloned());
            inner.status = params.status.clone();
            // An error report finishes the instance even without the done
            // flag set.
            if params.done || !params.status.is_ok() {
                inner.done = true;
                became_done = true;
            }
        }

        if progress_delta > 0 {
            ctx.progress.update(progress_delta);
        }

        if let Some(insert_status) = &params.insert_exec_status {
            if ctx.executor.is_none() {
                let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                for (partition, rows) in &insert_status.partition_row_counts {
                    *guard
                        .partition_row_counts
                        .entry(partition.clone())
                        .or_insert(0) += rows;
                }
                for (src, dest) in &insert_status.files_to_move {
                    guard.files_to_move.insert(src.clone(), dest.clone());
                }
            }
        }

        if became_done {
            debug!(
                query_id = %self.query_id,
                backend_num = state.backend_num,
                instance_id = %state.fragment_instance_id,
                status = %params.status,
                "backend finished"
            );
            let completion_ns = clamp_u128_to_i64(state.start.elapsed().as_nanos());
            let fragment_data = &ctx.fragment_profiles[state.fragment_idx];
            fragment_data
                .completion_times
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(completion_ns);
            let secs = completion_ns as f64 / 1_000_000_000.0;
            let rate = if secs > 0.0 {
                (state.total_split_bytes as f64 / secs) as i64
            } else {
                0
            };
            fragment_data
                .rates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(rate);

            let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.num_remaining_backends = guard.num_remaining_backends.saturating_sub(1);
            if guard.num_remaining_backends == 0 {
                self.backend_completion_cv.notify_all();
            }
        }

        if !params.status.is_ok() {
            self.update_status(params.status, Some(params.fragment_instance_id));
        }

        Status::ok()
    }

    /// Catalog changes required once the query has completed. Only valid
    /// after `wait()`; `None` when no update is needed.
    pub fn prepare_catalog_update(&self) -> Option<CatalogUpdate> {
        let ctx = self.exec_ctx.get()?;
        let finalize_params = ctx.finalize_params.as_ref()?;
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if guard.partition_row_counts.is_empty() {
            return None;
        }
        Some(CatalogUpdate {
            target_table: finalize_params.table_name.clone(),
            partition_row_counts: guard.partition_row_counts.clone(),
        })
    }

    /// Rows written per partition. Stable only after `wait()`.
    pub fn partition_row_counts(&self) -> BTreeMap<String, i64> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        guard.partition_row_counts.clone()
    }

    /// Concatenated error log of the coordinator and all backends.
    pub fn get_error_log(&self) -> String {
        let (status, states) = {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            (guard.query_status.clone(), guard.backend_states.clone())
        };
        let mut log = String::new();
        if !status.is_ok() {
            let _ = writeln!(log, "Query {}: {}", self.query_id, status);
        }
        for state in states {
            let inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
            if inner.error_log.is_empty() {
                continue;
            }
            let _ = writeln!(
                log,
                "Backend {} ({}): {}",
                state.backend_num,
                state.address,
                inner.error_log.join("\n")
            );
        }
        log
    }

    /// The set of hosts this query runs on. Only valid after `exec()`.
    pub fn unique_hosts(&self) -> HashSet<NetworkAddress> {
        self.exec_ctx
            .get()
            .map(|ctx| ctx.unique_hosts.clone())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> Option<&ProgressUpdater> {
        self.exec_ctx.get().map(|ctx| &ctx.progress)
    }

    /// Row descriptor of the result stream; `None` for queries without a
    /// root fragment.
    pub fn row_desc(&self) -> Option<SchemaRef> {
        self.exec_ctx.get().and_then(|ctx| ctx.row_desc.clone())
    }

    /// Cumulative profile aggregated over all fragments: per-node derived
    /// counters, per-fragment averaged profiles and per-instance trees.
    /// A snapshot; it changes while fragments are still executing.
    pub fn query_profile(&self) -> RuntimeProfile {
        let profile = RuntimeProfile::new(format!("Query (id={})", self.query_id));
        let Some(ctx) = self.exec_ctx.get() else {
            return profile;
        };

        let aggregate = profile.child("Aggregate");
        aggregate.add_info_string(
            "Progress",
            format!(
                "{} / {} scan ranges",
                ctx.progress.completed(),
                ctx.progress.total()
            ),
        );
        for node_id in &ctx.scan_node_ids {
            aggregate.counter_set(
                &format!("{} (plan_node_id={})", THROUGHPUT_COUNTER, node_id),
                CounterUnit::BytesPerSecond,
                self.compute_total_throughput(*node_id),
            );
            aggregate.counter_set(
                &format!("{} (plan_node_id={})", SCAN_RANGES_COMPLETE_COUNTER, node_id),
                CounterUnit::Unit,
                self.compute_total_scan_ranges_complete(*node_id),
            );
        }

        let states = {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.backend_states.clone()
        };
        for (idx, data) in ctx.fragment_profiles.iter().enumerate() {
            let fragment_root = profile.child(format!("Fragment {idx}"));
            fragment_root.add_info_string("NumInstances", data.num_instances.to_string());
            {
                let bytes = data
                    .bytes_assigned
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if bytes.count() > 0 {
                    fragment_root.add_info_string("SplitSizes", bytes.to_string());
                }
            }
            {
                let times = data
                    .completion_times
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if times.count() > 0 {
                    fragment_root.add_info_string("CompletionTimesNs", times.to_string());
                }
            }
            {
                let rates = data.rates.lock().unwrap_or_else(|e| e.into_inner());
                if rates.count() > 0 {
                    fragment_root.add_info_string("ExecutionRates", rates.to_string());
                }
            }

            let mut instance_profiles = Vec::new();
            for state in states.iter().filter(|s| s.fragment_idx == idx) {
                let inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
                let Some(instance_profile) = inner.profile.clone() else {
                    continue;
                };
                drop(inner);
                let copy = instance_profile.deep_clone();
                copy.set_name(format!(
                    "Instance {} (host={})",
                    state.fragment_instance_id, state.address
                ));
                fragment_root.add_child(copy);
                instance_profiles.push(instance_profile);
            }
            if !instance_profiles.is_empty() {
                let averaged = RuntimeProfile::merge_isomorphic_profiles(&instance_profiles);
                averaged.set_name(format!("Averaged Fragment {idx}"));
                profile.add_child(averaged);
            }
        }
        profile
    }

    /// Aggregate throughput for a scan node, summed across all live
    /// backend states.
    pub fn compute_total_throughput(&self, node_id: PlanNodeId) -> i64 {
        self.sum_scan_node_counter(node_id, THROUGHPUT_COUNTER)
    }

    /// Aggregate completed scan ranges for a scan node across all backends.
    pub fn compute_total_scan_ranges_complete(&self, node_id: PlanNodeId) -> i64 {
        self.sum_scan_node_counter(node_id, SCAN_RANGES_COMPLETE_COUNTER)
    }

    fn sum_scan_node_counter(&self, node_id: PlanNodeId, name: &str) -> i64 {
        let states = {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.backend_states.clone()
        };
        let mut total: i64 = 0;
        for state in states {
            let inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(profile) = &inner.profile else {
                continue;
            };
            if let Some(node_profile) = profile.find_by_metadata(node_id.as_i32() as i64) {
                total = total.saturating_add(node_profile.counter_value(name).unwrap_or(0));
            }
        }
        total
    }

    fn get_status(&self) -> Status {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        guard.query_status.clone()
    }

    /// Sole transition point from OK to a non-OK query status, and the sole
    /// place cancellation is initiated: both happen under the coordinator
    /// lock, so no thread can observe a non-OK status without cancellation
    /// having been started. Returns the effective query status.
    fn update_status(&self, status: Status, failed_instance: Option<UniqueId>) -> Status {
        if status.is_ok() {
            return self.get_status();
        }
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.query_status.is_ok() {
            return guard.query_status.clone();
        }
        if guard.returned_all_results {
            warn!(
                query_id = %self.query_id,
                error = %status,
                "ignoring error reported after all results were returned"
            );
            return guard.query_status.clone();
        }
        guard.query_status = status.clone();
        match failed_instance {
            Some(instance_id) => error!(
                query_id = %self.query_id,
                instance_id = %instance_id,
                error = %status,
                "query aborted"
            ),
            None => error!(query_id = %self.query_id, error = %status, "query aborted"),
        }
        self.cancel_internal(&mut guard);
        status
    }

    /// Runs cancel logic; the coordinator lock is held.
    fn cancel_internal(&self, guard: &mut CoordState) {
        if let Some(ctx) = self.exec_ctx.get() {
            if let Some(executor) = &ctx.executor {
                executor.cancel();
            }
        }
        self.cancel_remote_fragments(guard);
        // Wake every thread blocked on all-backends-done; they re-check
        // the predicate and observe the non-OK status.
        self.backend_completion_cv.notify_all();
    }

    /// Fires cancel RPCs for every started, not-yet-done backend, in
    /// backend_num order. The per-state lock serializes each check with an
    /// in-flight start RPC; the RPC itself runs on the background pool.
    fn cancel_remote_fragments(&self, guard: &mut CoordState) {
        for state in &guard.backend_states {
            {
                let inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
                if !inner.initiated || inner.done {
                    continue;
                }
            }
            debug!(
                query_id = %self.query_id,
                backend_num = state.backend_num,
                instance_id = %state.fragment_instance_id,
                "cancelling remote fragment"
            );
            let client = Arc::clone(self.exec_env.backend_client());
            let query_id = self.query_id;
            let instance_id = state.fragment_instance_id;
            let address = state.address.clone();
            let backend_num = state.backend_num;
            self.exec_env.cancel_pool().execute(move || {
                let status = client.cancel_plan_fragment(&address, query_id, instance_id);
                if !status.is_ok() {
                    warn!(
                        query_id = %query_id,
                        backend_num,
                        error = %status,
                        "cancel rpc failed"
                    );
                }
            });
        }
    }

    /// Returns when all backends have finished or the query is in error.
    /// Safe to call concurrently, any time after `exec()`.
    fn wait_for_all_backends(&self) -> Status {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            query_id = %self.query_id,
            remaining = guard.num_remaining_backends,
            "waiting for remote fragments to finish"
        );
        while guard.num_remaining_backends > 0 && guard.query_status.is_ok() {
            guard = self
                .backend_completion_cv
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
        guard.query_status.clone()
    }

    /// Post-query cleanup for DML: applies the accumulated file moves and
    /// leaves the catalog update ready. Requires all backends done. A
    /// failed move becomes the query's terminal status even though
    /// execution itself succeeded.
    fn finalize_query(&self) -> Status {
        let Some(ctx) = self.exec_ctx.get() else {
            return Status::internal_error("finalize before exec()");
        };
        let Some(finalize_params) = &ctx.finalize_params else {
            return Status::ok();
        };

        let status = self.wait_for_all_backends();
        if !status.is_ok() {
            return status;
        }

        let moves = {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.files_to_move.clone()
        };
        info!(
            query_id = %self.query_id,
            table = %finalize_params.table_name,
            moves = moves.len(),
            "finalizing query"
        );
        for (src, dest) in &moves {
            let status = if dest.is_empty() {
                self.exec_env.fs().delete_file(src)
            } else {
                self.exec_env.fs().move_file(src, dest)
            };
            if !status.is_ok() {
                let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
                if guard.query_status.is_ok() {
                    guard.query_status = status.clone();
                    self.cancel_internal(&mut guard);
                    return status;
                }
                return guard.query_status.clone();
            }
        }
        Status::ok()
    }

    fn create_backend_states(
        &self,
        request: &QueryExecRequest,
        schedule: &QuerySchedule,
        coord_addr: &NetworkAddress,
        fragment_profiles: &[PerFragmentProfileData],
    ) -> Vec<Arc<BackendExecState>> {
        let mut states = Vec::with_capacity(schedule.num_backends);
        let mut backend_num: i32 = 0;
        for idx in request.first_remote_fragment_idx()..request.fragments.len() {
            let fp = &schedule.fragment_exec_params[idx];
            let assignment = &schedule.scan_range_assignment[idx];
            let split_bytes = placement::host_split_bytes(assignment);
            for (instance_idx, host) in fp.hosts.iter().enumerate() {
                let rpc_params = build_exec_params(
                    request,
                    self.query_id,
                    idx,
                    instance_idx,
                    fp,
                    assignment,
                    coord_addr,
                    backend_num,
                );
                let bytes = split_bytes.get(host).copied().unwrap_or(0);
                fragment_profiles[idx]
                    .bytes_assigned
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update(bytes);
                states.push(Arc::new(BackendExecState {
                    backend_num,
                    fragment_idx: idx,
                    fragment_instance_id: fp.instance_ids[instance_idx],
                    address: host.clone(),
                    total_split_bytes: bytes,
                    rpc_params,
                    start: Instant::now(),
                    state: Mutex::new(BackendExecInner::default()),
                }));
                backend_num += 1;
            }
        }
        states
    }

    fn log_backend_info(&self, states: &[Arc<BackendExecState>]) {
        let mut per_host: BTreeMap<NetworkAddress, i64> = BTreeMap::new();
        for state in states {
            *per_host.entry(state.address.clone()).or_insert(0) += state.total_split_bytes;
        }
        for (host, split_bytes) in per_host {
            debug!(query_id = %self.query_id, host = %host, split_bytes, "assigned splits");
        }
    }

    /// Logs the per-fragment summary at the end of a successful query.
    fn report_query_summary(&self) {
        let Some(ctx) = self.exec_ctx.get() else {
            return;
        };
        for (idx, data) in ctx.fragment_profiles.iter().enumerate() {
            let bytes = data
                .bytes_assigned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .to_string();
            let times = data
                .completion_times
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .to_string();
            let rates = data.rates.lock().unwrap_or_else(|e| e.into_inner()).to_string();
            info!(
                query_id = %self.query_id,
                fragment_idx = idx,
                instances = data.num_instances,
                split_sizes = %bytes,
                completion_times_ns = %times,
                rates = %rates,
                "fragment summary"
            );
        }
    }
}

/// Issues the start RPC for one instance. Runs on a dispatch worker; the
/// per-state lock is held across the RPC so it serializes with status
/// updates and cancellation for the same instance.
fn exec_remote_fragment(client: Arc<dyn BackendClient>, state: Arc<BackendExecState>) {
    debug!(
        backend_num = state.backend_num,
        instance_id = %state.fragment_instance_id,
        host = %state.address,
        "starting remote fragment"
    );
    let mut inner = state.state.lock().unwrap_or_else(|e| e.into_inner());
    inner.initiated = true;
    let status = client.exec_plan_fragment(&state.address, &state.rpc_params);
    if !status.is_ok() {
        warn!(
            backend_num = state.backend_num,
            host = %state.address,
            error = %status,
            "start fragment rpc failed"
        );
    }
    inner.status = status;
}

/// Assembles the full start-fragment parameters for one instance from the
/// request constants and the fragment's placement.
#[allow(clippy::too_many_arguments)]
fn build_exec_params(
    request: &QueryExecRequest,
    query_id: UniqueId,
    fragment_idx: FragmentIdx,
    instance_idx: usize,
    fp: &FragmentExecParams,
    assignment: &FragmentScanRangeAssignment,
    coord: &NetworkAddress,
    backend_num: i32,
) -> ExecPlanFragmentParams {
    let host = &fp.hosts[instance_idx];
    let per_node_scan_ranges = assignment.get(host).cloned().unwrap_or_default();
    ExecPlanFragmentParams {
        fragment: request.fragments[fragment_idx].clone(),
        desc_tbl: request.desc_tbl.clone(),
        params: PlanFragmentExecParams {
            query_id,
            fragment_instance_id: fp.instance_ids[instance_idx],
            per_node_scan_ranges,
            per_exch_num_senders: fp.per_exch_num_senders.clone(),
            destinations: fp.destinations.clone(),
        },
        coord: coord.clone(),
        backend_num,
        query_globals: request.query_globals.clone(),
        query_options: request.query_options.clone(),
    }
}
