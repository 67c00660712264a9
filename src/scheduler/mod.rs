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
use std::collections::HashMap;
use std::sync::Mutex;

use crate::common::status::{Result, Status};
use crate::common::types::NetworkAddress;
use crate::plan::ScanRangeLocations;

/// Host-selection oracle consulted by the placement planner.
///
/// Given one scan range's replica set, returns the candidate hosts in
/// preference order; the planner executes the range on the first entry.
/// Implementations must be deterministic given the same call sequence.
pub trait Scheduler: Send + Sync {
    fn get_hosts(&self, location: &ScanRangeLocations) -> Result<Vec<NetworkAddress>>;
}

/// Volume-balancing scheduler: prefers the replica whose host currently has
/// the fewest assigned bytes, assuming the caller executes each range on the
/// first returned host. Ties break by replica order, then volume id.
#[derive(Default)]
pub struct SimpleScheduler {
    assigned_bytes: Mutex<HashMap<NetworkAddress, i64>>,
}

impl SimpleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assigned_bytes(&self, host: &NetworkAddress) -> i64 {
        let guard = self
            .assigned_bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.get(host).copied().unwrap_or(0)
    }
}

impl Scheduler for SimpleScheduler {
    fn get_hosts(&self, location: &ScanRangeLocations) -> Result<Vec<NetworkAddress>> {
        if location.replicas.is_empty() {
            return Err(Status::not_found(format!(
                "no replicas for scan range {}:{}+{}",
                location.scan_range.path, location.scan_range.offset, location.scan_range.length
            )));
        }

        let mut guard = self
            .assigned_bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let mut ranked: Vec<(i64, usize, i32, NetworkAddress)> = location
            .replicas
            .iter()
            .enumerate()
            .map(|(idx, replica)| {
                let bytes = guard.get(&replica.server).copied().unwrap_or(0);
                (bytes, idx, replica.volume_id, replica.server.clone())
            })
            .collect();
        ranked.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        // The planner runs the range on the first host; account for it.
        let chosen = ranked[0].3.clone();
        *guard.entry(chosen).or_insert(0) += location.scan_range.length.max(0);

        Ok(ranked.into_iter().map(|(_, _, _, host)| host).collect())
    }
}
