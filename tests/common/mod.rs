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
//! Shared fixtures for coordinator integration tests: mock worker RPC
//! client, mock root-fragment executor, mock filesystem, and request
//! builders for the standard SELECT / INSERT topologies.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};

use gneiss::common::ids::PlanNodeId;
use gneiss::common::status::{Result, Status};
use gneiss::common::types::{NetworkAddress, UniqueId};
use gneiss::fs::FileSystem;
use gneiss::plan::{
    DataSink, DescriptorTable, FinalizeParams, PartitionType, PlanFragment, PlanNode,
    PlanNodeType, QueryExecRequest, QueryGlobals, QueryOptions, ScanRange, ScanRangeLocations,
    ScanRangeReplica, StreamSink, TableSink,
};
use gneiss::runtime::coordinator::{SCAN_RANGES_COMPLETE_COUNTER, THROUGHPUT_COUNTER};
use gneiss::runtime::executor::{
    FragmentExecutor, FragmentExecutorFactory, RecordBatch, SchemaRef,
};
use gneiss::runtime::profile::{CounterUnit, RuntimeProfile};
use gneiss::scheduler::SimpleScheduler;
use gneiss::service::internal_service::{
    BackendClient, ExecPlanFragmentParams, ReportExecStatusParams,
};
use gneiss::ExecEnv;

pub const SCAN_NODE_ID: PlanNodeId = PlanNodeId::new(0);
pub const EXCHANGE_NODE_ID: PlanNodeId = PlanNodeId::new(1);

pub fn coord_addr() -> NetworkAddress {
    NetworkAddress::new("coord", 21000)
}

pub fn backend_hosts(n: usize) -> Vec<NetworkAddress> {
    (0..n)
        .map(|i| NetworkAddress::new(format!("backend-{i}"), 21000))
        .collect()
}

/// Records outbound RPCs; per-host start failures are injectable.
#[derive(Default)]
pub struct MockBackendClient {
    exec_calls: Mutex<Vec<(NetworkAddress, ExecPlanFragmentParams)>>,
    cancel_calls: Mutex<Vec<(NetworkAddress, UniqueId)>>,
    exec_failures: Mutex<HashMap<String, Status>>,
}

impl MockBackendClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_exec_on(&self, hostname: &str, status: Status) {
        self.exec_failures
            .lock()
            .unwrap()
            .insert(hostname.to_string(), status);
    }

    pub fn exec_calls(&self) -> Vec<(NetworkAddress, ExecPlanFragmentParams)> {
        self.exec_calls.lock().unwrap().clone()
    }

    pub fn num_exec_calls(&self) -> usize {
        self.exec_calls.lock().unwrap().len()
    }

    pub fn cancelled_instances(&self) -> Vec<UniqueId> {
        self.cancel_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }

    /// Dispatched instances as (instance id, backend_num, host), ordered by
    /// backend_num.
    pub fn dispatched_instances(&self) -> Vec<(UniqueId, i32, NetworkAddress)> {
        let mut out: Vec<(UniqueId, i32, NetworkAddress)> = self
            .exec_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, params)| {
                (
                    params.params.fragment_instance_id,
                    params.backend_num,
                    addr.clone(),
                )
            })
            .collect();
        out.sort_by_key(|(_, num, _)| *num);
        out
    }
}

impl BackendClient for MockBackendClient {
    fn exec_plan_fragment(
        &self,
        addr: &NetworkAddress,
        params: &ExecPlanFragmentParams,
    ) -> Status {
        self.exec_calls
            .lock()
            .unwrap()
            .push((addr.clone(), params.clone()));
        self.exec_failures
            .lock()
            .unwrap()
            .get(&addr.hostname)
            .cloned()
            .unwrap_or_else(Status::ok)
    }

    fn cancel_plan_fragment(
        &self,
        addr: &NetworkAddress,
        _query_id: UniqueId,
        fragment_instance_id: UniqueId,
    ) -> Status {
        self.cancel_calls
            .lock()
            .unwrap()
            .push((addr.clone(), fragment_instance_id));
        Status::ok()
    }
}

/// Root executor that serves a scripted sequence of batches/errors, then
/// end of stream. Cancellation drains it immediately.
pub struct MockExecutor {
    schema: SchemaRef,
    items: Mutex<VecDeque<Result<RecordBatch>>>,
    open_result: Status,
    cancelled: AtomicBool,
}

impl MockExecutor {
    pub fn with_batches(batches: Vec<RecordBatch>) -> Arc<Self> {
        Self::with_items(batches.into_iter().map(Ok).collect())
    }

    pub fn with_items(items: Vec<Result<RecordBatch>>) -> Arc<Self> {
        Arc::new(Self {
            schema: test_schema(),
            items: Mutex::new(items.into()),
            open_result: Status::ok(),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl FragmentExecutor for MockExecutor {
    fn open(&self) -> Status {
        self.open_result.clone()
    }

    fn get_next(&self) -> Result<Option<RecordBatch>> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.items.lock().unwrap().pop_front() {
            None => Ok(None),
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(status)) => Err(status),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn row_desc(&self) -> SchemaRef {
        self.schema.clone()
    }
}

pub struct MockExecutorFactory {
    executor: Option<Arc<MockExecutor>>,
}

impl FragmentExecutorFactory for MockExecutorFactory {
    fn create(&self, _params: &ExecPlanFragmentParams) -> Result<Arc<dyn FragmentExecutor>> {
        match &self.executor {
            Some(executor) => Ok(Arc::clone(executor) as Arc<dyn FragmentExecutor>),
            None => Err(Status::internal_error("no root executor configured")),
        }
    }
}

/// Records finalization file operations; move failures are injectable.
#[derive(Default)]
pub struct MockFileSystem {
    moves: Mutex<Vec<(String, String)>>,
    deletes: Mutex<Vec<String>>,
    fail_moves: Mutex<Option<Status>>,
}

impl MockFileSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_moves_with(&self, status: Status) {
        *self.fail_moves.lock().unwrap() = Some(status);
    }

    pub fn moves(&self) -> Vec<(String, String)> {
        self.moves.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

impl FileSystem for MockFileSystem {
    fn move_file(&self, src: &str, dest: &str) -> Status {
        if let Some(status) = self.fail_moves.lock().unwrap().clone() {
            return status;
        }
        self.moves
            .lock()
            .unwrap()
            .push((src.to_string(), dest.to_string()));
        Status::ok()
    }

    fn delete_file(&self, path: &str) -> Status {
        self.deletes.lock().unwrap().push(path.to_string());
        Status::ok()
    }
}

pub fn test_env(
    client: Arc<MockBackendClient>,
    executor: Option<Arc<MockExecutor>>,
    fs: Arc<MockFileSystem>,
) -> Arc<ExecEnv> {
    ExecEnv::new(
        coord_addr(),
        client,
        Arc::new(SimpleScheduler::new()),
        fs,
        Arc::new(MockExecutorFactory { executor }),
    )
}

pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
}

pub fn int_batch(rows: usize) -> RecordBatch {
    let values = Int64Array::from_iter_values(0..rows as i64);
    RecordBatch::try_new(test_schema(), vec![Arc::new(values)]).expect("build record batch")
}

fn scan_locations(hosts: &[NetworkAddress], ranges_per_host: usize) -> Vec<ScanRangeLocations> {
    let mut locations = Vec::new();
    for (h, host) in hosts.iter().enumerate() {
        for r in 0..ranges_per_host {
            locations.push(ScanRangeLocations::new(
                ScanRange::new(format!("/data/h{h}/part-{r}"), 0, 1000),
                vec![ScanRangeReplica::new(host.clone(), 0)],
            ));
        }
    }
    locations
}

/// Root fragment on the coordinator consuming an exchange fed by one scan
/// fragment distributed over `hosts`.
pub fn select_request(hosts: &[NetworkAddress], ranges_per_host: usize) -> QueryExecRequest {
    let root = PlanFragment {
        plan: PlanNode::new(
            PlanNodeId::new(2),
            PlanNodeType::SelectNode,
            vec![PlanNode::leaf(EXCHANGE_NODE_ID, PlanNodeType::ExchangeNode)],
        ),
        output_sink: None,
        partition: PartitionType::Unpartitioned,
    };
    let scan = PlanFragment {
        plan: PlanNode::leaf(SCAN_NODE_ID, PlanNodeType::ScanNode),
        output_sink: Some(DataSink::Stream(StreamSink {
            dest_node_id: EXCHANGE_NODE_ID,
        })),
        partition: PartitionType::HashPartitioned,
    };

    QueryExecRequest {
        fragments: vec![root, scan],
        has_root_fragment: true,
        desc_tbl: DescriptorTable::default(),
        query_globals: QueryGlobals::default(),
        query_options: QueryOptions::default(),
        scan_range_locations: HashMap::from([(
            SCAN_NODE_ID,
            scan_locations(hosts, ranges_per_host),
        )]),
        finalize_params: None,
    }
}

/// Distributed INSERT: no root fragment, one scan fragment writing into
/// `target_table` on every host.
pub fn insert_request(hosts: &[NetworkAddress], ranges_per_host: usize) -> QueryExecRequest {
    let scan = PlanFragment {
        plan: PlanNode::leaf(SCAN_NODE_ID, PlanNodeType::ScanNode),
        output_sink: Some(DataSink::Table(TableSink {
            table_name: "target_table".to_string(),
            overwrite: false,
        })),
        partition: PartitionType::HashPartitioned,
    };

    QueryExecRequest {
        fragments: vec![scan],
        has_root_fragment: false,
        desc_tbl: DescriptorTable::default(),
        query_globals: QueryGlobals::default(),
        query_options: QueryOptions::default(),
        scan_range_locations: HashMap::from([(
            SCAN_NODE_ID,
            scan_locations(hosts, ranges_per_host),
        )]),
        finalize_params: Some(FinalizeParams {
            table_name: "target_table".to_string(),
            base_dir: "/warehouse/target_table".to_string(),
            is_overwrite: false,
        }),
    }
}

pub fn report(
    query_id: UniqueId,
    instance_id: UniqueId,
    backend_num: i32,
    done: bool,
    status: Status,
) -> ReportExecStatusParams {
    ReportExecStatusParams {
        query_id,
        backend_num,
        fragment_instance_id: instance_id,
        status,
        done,
        profile: None,
        error_log: Vec::new(),
        insert_exec_status: None,
    }
}

/// Instance profile with a scan node child carrying the counters the
/// coordinator aggregates.
pub fn scan_profile(node_id: PlanNodeId, ranges_complete: i64, throughput: i64) -> RuntimeProfile {
    let profile = RuntimeProfile::new("Instance");
    let scan = profile.child(format!("SCAN_NODE (id={node_id})"));
    scan.set_metadata(node_id.as_i32() as i64);
    scan.counter_set(SCAN_RANGES_COMPLETE_COUNTER, CounterUnit::Unit, ranges_complete);
    scan.counter_set(THROUGHPUT_COUNTER, CounterUnit::BytesPerSecond, throughput);
    profile
}

/// Runs `f` on a helper thread and panics if it does not finish in `d`.
pub fn assert_completes_within<T: Send + 'static>(
    d: Duration,
    f: impl FnOnce() -> T + Send + 'static,
) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(d).expect("operation did not finish in time")
}
