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
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;

use crate::common::config;

/// Tracks completed scan ranges against the fixed total established at
/// placement time. Completion only moves forward and never exceeds the
/// total, regardless of what reports deliver.
#[derive(Debug)]
pub struct ProgressUpdater {
    label: String,
    total: i64,
    completed: AtomicI64,
    log_period: i64,
}

impl ProgressUpdater {
    pub fn new(label: impl Into<String>, total: i64) -> Self {
        Self {
            label: label.into(),
            total: total.max(0),
            completed: AtomicI64::new(0),
            log_period: config::progress_log_period(),
        }
    }

    /// Adds `delta` completed ranges, clamped into `[0, total]`.
    pub fn update(&self, delta: i64) {
        if delta <= 0 {
            return;
        }
        let mut current = self.completed.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(delta).min(self.total);
            match self.completed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if current / self.log_period != next / self.log_period || next == self.total {
                        debug!(
                            label = %self.label,
                            completed = next,
                            total = self.total,
                            "progress"
                        );
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn completed(&self) -> i64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn done(&self) -> bool {
        self.completed() >= self.total
    }

    /// Fraction complete in `[0, 1]`; 1 for a query with no scan ranges.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed() as f64 / self.total as f64
        }
    }
}
