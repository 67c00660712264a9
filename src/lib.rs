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
//! gneiss: the distributed query coordinator of a parallel SQL execution
//! engine. Given a planned query (a tree of plan fragments), a
//! [`Coordinator`](runtime::coordinator::Coordinator) places fragment
//! instances across worker backends, drives the locally-executing root
//! fragment, aggregates status and runtime statistics from the workers,
//! propagates failure and cancellation atomically, and finalizes INSERT
//! side effects.

pub mod common;
pub mod fs;
pub mod plan;
pub mod runtime;
pub mod scheduler;
pub mod service;

pub use common::logging as gneiss_logging;

pub use common::status::{Status, StatusCode};
pub use common::types::{NetworkAddress, UniqueId};
pub use runtime::coordinator::Coordinator;
pub use runtime::exec_env::ExecEnv;
