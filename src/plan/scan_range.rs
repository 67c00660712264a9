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
use crate::common::types::NetworkAddress;

/// A contiguous unit of input data (e.g. a file split) consumed by one
/// scan node instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScanRange {
    pub path: String,
    pub offset: i64,
    pub length: i64,
}

impl ScanRange {
    pub fn new(path: impl Into<String>, offset: i64, length: i64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }
}

/// One candidate replica of a scan range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanRangeReplica {
    pub server: NetworkAddress,
    pub volume_id: i32,
}

impl ScanRangeReplica {
    pub fn new(server: NetworkAddress, volume_id: i32) -> Self {
        Self { server, volume_id }
    }
}

/// A scan range together with the replicas it can be read from. The
/// placement planner picks exactly one replica host per range.
#[derive(Clone, Debug)]
pub struct ScanRangeLocations {
    pub scan_range: ScanRange,
    pub replicas: Vec<ScanRangeReplica>,
}

impl ScanRangeLocations {
    pub fn new(scan_range: ScanRange, replicas: Vec<ScanRangeReplica>) -> Self {
        Self {
            scan_range,
            replicas,
        }
    }
}

/// A scan range as handed to a fragment instance: the range plus the volume
/// the chosen replica lives on (-1 when the executing host is not a replica).
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRangeParams {
    pub scan_range: ScanRange,
    pub volume_id: i32,
}
