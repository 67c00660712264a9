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

use threadpool::ThreadPool;

use crate::common::config;
use crate::common::types::NetworkAddress;
use crate::fs::FileSystem;
use crate::runtime::executor::FragmentExecutorFactory;
use crate::scheduler::Scheduler;
use crate::service::internal_service::BackendClient;

/// Process-wide collaborators shared by every coordinator: the worker RPC
/// client, the placement oracle, the filesystem used for finalization, the
/// root-executor factory, and the background pool cancel RPCs are fired on.
pub struct ExecEnv {
    coord_address: NetworkAddress,
    backend_client: Arc<dyn BackendClient>,
    scheduler: Arc<dyn Scheduler>,
    fs: Arc<dyn FileSystem>,
    executor_factory: Arc<dyn FragmentExecutorFactory>,
    cancel_pool: ThreadPool,
}

impl ExecEnv {
    pub fn new(
        coord_address: NetworkAddress,
        backend_client: Arc<dyn BackendClient>,
        scheduler: Arc<dyn Scheduler>,
        fs: Arc<dyn FileSystem>,
        executor_factory: Arc<dyn FragmentExecutorFactory>,
    ) -> Arc<Self> {
        let cancel_pool = ThreadPool::with_name(
            "coordinator cancel".to_string(),
            config::cancel_threads(),
        );
        Arc::new(Self {
            coord_address,
            backend_client,
            scheduler,
            fs,
            executor_factory,
            cancel_pool,
        })
    }

    pub fn coord_address(&self) -> &NetworkAddress {
        &self.coord_address
    }

    pub fn backend_client(&self) -> &Arc<dyn BackendClient> {
        &self.backend_client
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn executor_factory(&self) -> &Arc<dyn FragmentExecutorFactory> {
        &self.executor_factory
    }

    pub fn cancel_pool(&self) -> &ThreadPool {
        &self.cancel_pool
    }
}
