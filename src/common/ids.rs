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
use std::fmt;
use std::str::FromStr;

/// Id of a plan node within a query plan.
///
/// Plan node ids are assigned by the planner and are unique across all
/// fragments of one query, which is what lets scan-range maps and exchange
/// sender counts be keyed by node id alone.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PlanNodeId(pub i32);

impl PlanNodeId {
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PlanNodeId> for i32 {
    fn from(value: PlanNodeId) -> Self {
        value.0
    }
}

impl FromStr for PlanNodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s
            .parse::<i32>()
            .map_err(|_| format!("invalid plan node id: {}", s))?;
        Ok(Self(v))
    }
}

/// Index of a fragment in the exec request's fragment list. Fragment 0 is
/// the root fragment when the request carries one.
pub type FragmentIdx = usize;
