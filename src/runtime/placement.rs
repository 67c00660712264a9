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
//! Placement planning: decides which hosts run each fragment, assigns every
//! scan range to exactly one (host, fragment instance), and derives the
//! per-fragment exec params (instance ids, stream destinations, exchange
//! sender counts) that dispatch combines into per-instance RPC parameters.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::common::ids::PlanNodeId;
use crate::common::status::{Result, Status};
use crate::common::types::{NetworkAddress, UniqueId};
use crate::plan::{QueryExecRequest, ScanRangeParams};
use crate::scheduler::Scheduler;
use crate::service::internal_service::PlanFragmentDestination;

/// Scan ranges for one host, grouped by scan node.
pub type PerNodeScanRanges = HashMap<PlanNodeId, Vec<ScanRangeParams>>;

/// Scan-range assignment for a single fragment: host -> per-node ranges.
/// The union of ranges across hosts equals the fragment's input set; every
/// range appears exactly once.
pub type FragmentScanRangeAssignment = HashMap<NetworkAddress, PerNodeScanRanges>;

/// Fragment-scoped placement results. `hosts` and `instance_ids` are
/// parallel vectors: instance i of the fragment runs on `hosts[i]`.
#[derive(Clone, Debug, Default)]
pub struct FragmentExecParams {
    pub hosts: Vec<NetworkAddress>,
    pub instance_ids: Vec<UniqueId>,
    pub destinations: Vec<PlanFragmentDestination>,
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
}

impl FragmentExecParams {
    pub fn num_instances(&self) -> usize {
        self.hosts.len()
    }
}

/// The full placement for one query.
#[derive(Debug)]
pub struct QuerySchedule {
    pub fragment_exec_params: Vec<FragmentExecParams>,
    pub scan_range_assignment: Vec<FragmentScanRangeAssignment>,
    pub num_scan_ranges: i64,
    /// Number of remotely dispatched fragment instances.
    pub num_backends: usize,
    pub unique_hosts: HashSet<NetworkAddress>,
}

/// Computes the complete placement. Fails (before any RPC is sent) if the
/// scheduler cannot produce a host for a required replica set or if an
/// exchange has no feeding fragment.
pub fn compute_query_schedule(
    request: &QueryExecRequest,
    query_id: UniqueId,
    coord: &NetworkAddress,
    scheduler: &dyn Scheduler,
) -> Result<QuerySchedule> {
    let (scan_range_assignment, num_scan_ranges) =
        compute_scan_range_assignment(request, coord, scheduler)?;
    let fragment_exec_params =
        compute_fragment_exec_params(request, query_id, coord, &scan_range_assignment)?;

    let mut unique_hosts: HashSet<NetworkAddress> = HashSet::new();
    for params in &fragment_exec_params {
        unique_hosts.extend(params.hosts.iter().cloned());
    }
    unique_hosts.insert(coord.clone());

    let num_backends = fragment_exec_params
        .iter()
        .skip(request.first_remote_fragment_idx())
        .map(FragmentExecParams::num_instances)
        .sum();

    Ok(QuerySchedule {
        fragment_exec_params,
        scan_range_assignment,
        num_scan_ranges,
        num_backends,
        unique_hosts,
    })
}

/// Assigns every scan range of every fragment to exactly one host.
/// Unpartitioned fragments read all of their ranges on the coordinator;
/// everything else follows the scheduler oracle's preferred replica.
/// Returns one assignment per fragment plus the global range total.
pub fn compute_scan_range_assignment(
    request: &QueryExecRequest,
    coord: &NetworkAddress,
    scheduler: &dyn Scheduler,
) -> Result<(Vec<FragmentScanRangeAssignment>, i64)> {
    let mut assignments = Vec::with_capacity(request.fragments.len());
    let mut num_scan_ranges: i64 = 0;

    for fragment in &request.fragments {
        let exec_at_coord = fragment.is_unpartitioned();
        let mut assignment = FragmentScanRangeAssignment::new();

        let mut scan_node_ids = Vec::new();
        fragment.plan.collect_scan_node_ids(&mut scan_node_ids);

        for node_id in scan_node_ids {
            let Some(locations) = request.scan_range_locations.get(&node_id) else {
                continue;
            };
            num_scan_ranges += locations.len() as i64;

            for location in locations {
                let (host, volume_id) = if exec_at_coord {
                    let volume = location
                        .replicas
                        .iter()
                        .find(|r| &r.server == coord)
                        .map(|r| r.volume_id)
                        .unwrap_or(-1);
                    (coord.clone(), volume)
                } else {
                    let hosts = scheduler.get_hosts(location)?;
                    let host = hosts.first().cloned().ok_or_else(|| {
                        Status::internal_error(format!(
                            "scheduler produced no host for scan range {} of node {}",
                            location.scan_range.path, node_id
                        ))
                    })?;
                    let volume = location
                        .replicas
                        .iter()
                        .find(|r| r.server == host)
                        .map(|r| r.volume_id)
                        .unwrap_or(-1);
                    (host, volume)
                };

                assignment
                    .entry(host)
                    .or_default()
                    .entry(node_id)
                    .or_default()
                    .push(ScanRangeParams {
                        scan_range: location.scan_range.clone(),
                        volume_id,
                    });
            }
        }

        assignments.push(assignment);
    }

    Ok((assignments, num_scan_ranges))
}

/// Derives per-fragment hosts, instance ids, destinations and exchange
/// sender counts from the scan-range assignment and the exchange topology.
pub fn compute_fragment_exec_params(
    request: &QueryExecRequest,
    query_id: UniqueId,
    coord: &NetworkAddress,
    assignments: &[FragmentScanRangeAssignment],
) -> Result<Vec<FragmentExecParams>> {
    let hosts = compute_fragment_hosts(request, coord, assignments)?;

    let mut params: Vec<FragmentExecParams> = hosts
        .into_iter()
        .map(|hosts| FragmentExecParams {
            hosts,
            ..FragmentExecParams::default()
        })
        .collect();

    // Instance ids: the root instance reuses the query id; every other
    // instance gets a dense offset above it, in fragment order.
    let mut instance_num: i64 = 0;
    for (idx, fp) in params.iter_mut().enumerate() {
        for _ in 0..fp.hosts.len() {
            if idx == 0 && request.has_root_fragment {
                fp.instance_ids.push(query_id);
            } else {
                instance_num += 1;
                fp.instance_ids.push(query_id.offset_lo(instance_num));
            }
        }
    }

    // Stream destinations: one entry per instance of the consuming
    // fragment. The consumer's sender-count map accumulates the number of
    // producer instances per exchange node.
    for idx in 0..request.fragments.len() {
        let Some(sink) = request.fragments[idx].stream_sink() else {
            continue;
        };
        let dest_node_id = sink.dest_node_id;
        let consumer_idx = find_exchange_consumer(request, idx, dest_node_id)?;

        let destinations: Vec<PlanFragmentDestination> = params[consumer_idx]
            .hosts
            .iter()
            .zip(params[consumer_idx].instance_ids.iter())
            .map(|(server, instance_id)| PlanFragmentDestination {
                fragment_instance_id: *instance_id,
                server: server.clone(),
                dest_node_id,
            })
            .collect();

        let num_senders = params[idx].num_instances();
        params[idx].destinations = destinations;
        *params[consumer_idx]
            .per_exch_num_senders
            .entry(dest_node_id)
            .or_insert(0) += num_senders;
    }

    Ok(params)
}

/// Per-host split-byte totals for one fragment's assignment.
pub fn host_split_bytes(assignment: &FragmentScanRangeAssignment) -> HashMap<NetworkAddress, i64> {
    let mut bytes = HashMap::new();
    for (host, per_node) in assignment {
        let total: i64 = per_node
            .values()
            .flatten()
            .map(|r| r.scan_range.length.max(0))
            .fold(0i64, i64::saturating_add);
        bytes.insert(host.clone(), total);
    }
    bytes
}

fn compute_fragment_hosts(
    request: &QueryExecRequest,
    coord: &NetworkAddress,
    assignments: &[FragmentScanRangeAssignment],
) -> Result<Vec<Vec<NetworkAddress>>> {
    let n = request.fragments.len();
    let mut hosts: Vec<Vec<NetworkAddress>> = vec![Vec::new(); n];

    // Walk leaves-first so that a fragment consuming an exchange sees the
    // hosts of the fragment feeding it.
    for idx in (0..n).rev() {
        let fragment = &request.fragments[idx];

        if idx == 0 && request.has_root_fragment {
            hosts[idx] = vec![coord.clone()];
            continue;
        }
        if fragment.is_unpartitioned() {
            hosts[idx] = vec![coord.clone()];
            continue;
        }

        let leftmost = fragment.plan.leftmost_leaf();
        if leftmost.node_type.is_exchange() {
            let producer_idx = find_exchange_producer(request, idx, leftmost.node_id)?;
            let producer_hosts = hosts[producer_idx].clone();
            hosts[idx] = producer_hosts;
            continue;
        }

        // Scan-rooted fragment: the hosts its scan ranges were assigned to,
        // in deterministic order.
        let assigned: BTreeSet<&NetworkAddress> = assignments[idx].keys().collect();
        if assigned.is_empty() {
            debug!(fragment_idx = idx, "fragment has no scan ranges, running on coordinator");
            hosts[idx] = vec![coord.clone()];
        } else {
            hosts[idx] = assigned.into_iter().cloned().collect();
        }
    }

    Ok(hosts)
}

/// Index of the fragment whose stream sink feeds `exchange_id`.
fn find_exchange_producer(
    request: &QueryExecRequest,
    consumer_idx: usize,
    exchange_id: PlanNodeId,
) -> Result<usize> {
    for (idx, fragment) in request.fragments.iter().enumerate() {
        if idx == consumer_idx {
            continue;
        }
        if let Some(sink) = fragment.stream_sink() {
            if sink.dest_node_id == exchange_id {
                return Ok(idx);
            }
        }
    }
    Err(Status::internal_error(format!(
        "no fragment feeds exchange node {} of fragment {}",
        exchange_id, consumer_idx
    )))
}

/// Index of the fragment containing exchange node `exchange_id`.
fn find_exchange_consumer(
    request: &QueryExecRequest,
    producer_idx: usize,
    exchange_id: PlanNodeId,
) -> Result<usize> {
    for (idx, fragment) in request.fragments.iter().enumerate() {
        if idx == producer_idx {
            continue;
        }
        if let Some(node) = fragment.plan.find_node(exchange_id) {
            if node.node_type.is_exchange() {
                return Ok(idx);
            }
        }
    }
    Err(Status::internal_error(format!(
        "no fragment consumes exchange node {} fed by fragment {}",
        exchange_id, producer_idx
    )))
}
