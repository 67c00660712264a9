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
use std::sync::Arc;

pub use arrow::datatypes::SchemaRef;
pub use arrow::record_batch::RecordBatch;

use crate::common::status::{Result, Status};
use crate::service::internal_service::ExecPlanFragmentParams;

/// Executes the root fragment locally and streams its result rows.
///
/// The coordinator treats the executor as an opaque source: `open` may
/// block until rows are ready, `get_next` yields batches until `Ok(None)`
/// (end of stream), and `cancel` is a non-blocking signal after which
/// `get_next` drains to end of stream. Returned batches stay valid until
/// the next `get_next` call.
pub trait FragmentExecutor: Send + Sync {
    fn open(&self) -> Status;

    fn get_next(&self) -> Result<Option<RecordBatch>>;

    fn cancel(&self);

    fn row_desc(&self) -> SchemaRef;
}

/// Builds the executor for the root fragment instance from its fully
/// assembled exec params.
pub trait FragmentExecutorFactory: Send + Sync {
    fn create(&self, params: &ExecPlanFragmentParams) -> Result<Arc<dyn FragmentExecutor>>;
}
