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

use crate::common::ids::PlanNodeId;
use crate::plan::scan_range::ScanRangeLocations;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PlanNodeType {
    ScanNode,
    ExchangeNode,
    AggregationNode,
    HashJoinNode,
    SortNode,
    SelectNode,
}

impl PlanNodeType {
    pub fn is_scan(self) -> bool {
        self == PlanNodeType::ScanNode
    }

    pub fn is_exchange(self) -> bool {
        self == PlanNodeType::ExchangeNode
    }
}

/// A node of a fragment's plan tree. Children are ordered; child 0 is the
/// node's leftmost input.
#[derive(Clone, Debug)]
pub struct PlanNode {
    pub node_id: PlanNodeId,
    pub node_type: PlanNodeType,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(node_id: PlanNodeId, node_type: PlanNodeType, children: Vec<PlanNode>) -> Self {
        Self {
            node_id,
            node_type,
            children,
        }
    }

    pub fn leaf(node_id: PlanNodeId, node_type: PlanNodeType) -> Self {
        Self::new(node_id, node_type, Vec::new())
    }

    /// The node reached by following leftmost children from this node down
    /// to a leaf, i.e. the first input the fragment consumes.
    pub fn leftmost_leaf(&self) -> &PlanNode {
        let mut node = self;
        while let Some(child) = node.children.first() {
            node = child;
        }
        node
    }

    /// Collects the ids of all scan nodes in this subtree, preorder.
    pub fn collect_scan_node_ids(&self, out: &mut Vec<PlanNodeId>) {
        if self.node_type.is_scan() {
            out.push(self.node_id);
        }
        for child in &self.children {
            child.collect_scan_node_ids(out);
        }
    }

    /// Looks up a node by id anywhere in this subtree.
    pub fn find_node(&self, node_id: PlanNodeId) -> Option<&PlanNode> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find_node(node_id))
    }
}

/// How a fragment's instances partition their input.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionType {
    Unpartitioned,
    HashPartitioned,
    RandomPartitioned,
}

/// Sink routing a fragment's output rows to the exchange node `dest_node_id`
/// in a consuming fragment.
#[derive(Clone, Debug)]
pub struct StreamSink {
    pub dest_node_id: PlanNodeId,
}

/// Sink writing a fragment's output rows into a table (INSERT).
#[derive(Clone, Debug)]
pub struct TableSink {
    pub table_name: String,
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub enum DataSink {
    Stream(StreamSink),
    Table(TableSink),
}

/// A sub-tree of the plan executed as one unit on each of its hosts.
#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub plan: PlanNode,
    pub output_sink: Option<DataSink>,
    pub partition: PartitionType,
}

impl PlanFragment {
    pub fn is_unpartitioned(&self) -> bool {
        self.partition == PartitionType::Unpartitioned
    }

    pub fn stream_sink(&self) -> Option<&StreamSink> {
        match &self.output_sink {
            Some(DataSink::Stream(sink)) => Some(sink),
            _ => None,
        }
    }

    pub fn table_sink(&self) -> Option<&TableSink> {
        match &self.output_sink {
            Some(DataSink::Table(sink)) => Some(sink),
            _ => None,
        }
    }
}

/// Constants shared by all fragments of one query.
#[derive(Clone, Debug, Default)]
pub struct QueryGlobals {
    pub now_string: String,
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub batch_size: i32,
    pub max_errors: i32,
    pub mem_limit: i64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            max_errors: 100,
            mem_limit: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TupleDescriptor {
    pub id: i32,
    pub byte_size: i32,
}

/// Row layout metadata, constant across all fragments; forwarded to every
/// fragment instance verbatim.
#[derive(Clone, Debug, Default)]
pub struct DescriptorTable {
    pub tuple_descriptors: Vec<TupleDescriptor>,
}

/// Post-execution work for DML queries: where staged files land and which
/// table the catalog update targets.
#[derive(Clone, Debug)]
pub struct FinalizeParams {
    pub table_name: String,
    pub base_dir: String,
    pub is_overwrite: bool,
}

/// The planner's output: everything the coordinator needs to run one query.
///
/// Fragments are ordered parents-first; when `has_root_fragment` is set,
/// fragment 0 runs locally on the coordinator and produces the result rows.
#[derive(Clone, Debug)]
pub struct QueryExecRequest {
    pub fragments: Vec<PlanFragment>,
    pub has_root_fragment: bool,
    pub desc_tbl: DescriptorTable,
    pub query_globals: QueryGlobals,
    pub query_options: QueryOptions,
    /// Scan ranges per scan node, keyed by plan node id (node ids are unique
    /// across the whole plan).
    pub scan_range_locations: HashMap<PlanNodeId, Vec<ScanRangeLocations>>,
    pub finalize_params: Option<FinalizeParams>,
}

impl QueryExecRequest {
    /// Index of the first fragment that executes remotely. With a root
    /// fragment, fragment 0 runs on the coordinator itself.
    pub fn first_remote_fragment_idx(&self) -> usize {
        usize::from(self.has_root_fragment)
    }

    /// True if some fragment writes a table (the query has side effects to
    /// finalize).
    pub fn has_table_sink(&self) -> bool {
        self.fragments.iter().any(|f| f.table_sink().is_some())
    }
}
