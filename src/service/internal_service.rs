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
//! The coordinator <-> worker surface: parameters for starting, cancelling
//! and reporting on fragment instances, plus the outbound client trait.
//! Transport and serialization live outside this crate; an embedding server
//! implements [`BackendClient`] over its RPC stack and routes inbound
//! reports to `Coordinator::update_fragment_exec_status`.

use std::collections::{BTreeMap, HashMap};

use crate::common::ids::PlanNodeId;
use crate::common::status::Status;
use crate::common::types::{NetworkAddress, UniqueId};
use crate::plan::{DescriptorTable, PlanFragment, QueryGlobals, QueryOptions, ScanRangeParams};
use crate::runtime::profile::RuntimeProfile;

/// One receiver of a fragment's output stream: an instance of the consuming
/// fragment and the exchange node in it that the rows are addressed to.
#[derive(Clone, Debug)]
pub struct PlanFragmentDestination {
    pub fragment_instance_id: UniqueId,
    pub server: NetworkAddress,
    pub dest_node_id: PlanNodeId,
}

/// Instance-scoped placement results for one fragment instance.
#[derive(Clone, Debug)]
pub struct PlanFragmentExecParams {
    pub query_id: UniqueId,
    pub fragment_instance_id: UniqueId,
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeParams>>,
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
    pub destinations: Vec<PlanFragmentDestination>,
}

/// Everything a worker needs to start one fragment instance.
#[derive(Clone, Debug)]
pub struct ExecPlanFragmentParams {
    pub fragment: PlanFragment,
    pub desc_tbl: DescriptorTable,
    pub params: PlanFragmentExecParams,
    /// Where the worker sends its status reports.
    pub coord: NetworkAddress,
    /// Dense per-query number of this instance; -1 for the local root.
    pub backend_num: i32,
    pub query_globals: QueryGlobals,
    pub query_options: QueryOptions,
}

/// INSERT side effects accumulated by a fragment instance: rows written per
/// partition ("" = unpartitioned table) and files to relocate at finalize
/// time (empty destination = delete).
#[derive(Clone, Debug, Default)]
pub struct InsertExecStatus {
    pub partition_row_counts: BTreeMap<String, i64>,
    pub files_to_move: BTreeMap<String, String>,
}

/// Periodic (and final) execution report pushed by a worker for one
/// fragment instance. Per-instance ordering is the caller's responsibility;
/// the coordinator never sees two concurrent reports for the same instance.
#[derive(Clone, Debug)]
pub struct ReportExecStatusParams {
    pub query_id: UniqueId,
    pub backend_num: i32,
    pub fragment_instance_id: UniqueId,
    pub status: Status,
    pub done: bool,
    pub profile: Option<RuntimeProfile>,
    pub error_log: Vec<String>,
    pub insert_exec_status: Option<InsertExecStatus>,
}

/// Outbound RPCs to worker backends. Both calls are synchronous from the
/// caller's thread; `cancel_plan_fragment` must be idempotent on the worker.
pub trait BackendClient: Send + Sync {
    fn exec_plan_fragment(&self, addr: &NetworkAddress, params: &ExecPlanFragmentParams)
        -> Status;

    fn cancel_plan_fragment(
        &self,
        addr: &NetworkAddress,
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
    ) -> Status;
}
