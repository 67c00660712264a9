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
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CounterUnit {
    Unit,
    Bytes,
    Rows,
    TimeNs,
    BytesPerSecond,
    UnitPerSecond,
}

impl CounterUnit {
    fn is_time_based(self) -> bool {
        matches!(self, CounterUnit::TimeNs)
    }
}

/// How a counter merges across isomorphic instance profiles.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MergePolicy {
    Sum,
    Avg,
}

fn merge_policy(unit: CounterUnit) -> MergePolicy {
    if unit.is_time_based() {
        MergePolicy::Avg
    } else {
        MergePolicy::Sum
    }
}

#[derive(Clone, Debug)]
struct CounterSnapshot {
    name: String,
    unit: CounterUnit,
    value: i64,
}

/// A named tree of counters and info strings describing one execution.
///
/// Metadata holds the plan node id for profiles describing a plan node
/// (-1 otherwise), which is how the coordinator locates scan-node counters
/// when computing query-wide derived counters.
#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: RwLock<String>,
    metadata: AtomicI64,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
    child_map: Mutex<HashMap<String, RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: RwLock::new(name.into()),
                metadata: AtomicI64::new(-1),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                child_map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let mut guard = self.inner.name.write().unwrap_or_else(|e| e.into_inner());
        *guard = name.into();
    }

    pub fn metadata(&self) -> i64 {
        self.inner.metadata.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, md: i64) {
        self.inner.metadata.store(md, Ordering::Relaxed);
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_child(&self, child: RuntimeProfile) {
        let child_name = child.name();
        {
            let mut map = self
                .inner
                .child_map
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if map.contains_key(&child_name) {
                return;
            }
            map.insert(child_name.clone(), child.clone());
        }
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        children.push(child);
    }

    /// Returns the existing child of that name, creating it if absent.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        if let Some(existing) = self
            .inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .cloned()
        {
            return existing;
        }
        let child = RuntimeProfile::new(name);
        self.add_child(child.clone());
        child
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn copy_all_info_strings_from(&self, other: &RuntimeProfile) {
        let snapshot = other
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (k, v) in snapshot {
            guard.insert(k, v);
        }
    }

    pub fn copy_all_counters_from(&self, other: &RuntimeProfile) {
        for s in other.counter_snapshots() {
            let c = self.add_counter(s.name, s.unit);
            c.set(s.value);
        }
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = guard.get(&name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(name.clone(), unit));
        guard.insert(name, Arc::clone(&counter));
        counter
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        let c = self.add_counter(name.to_string(), unit);
        c.add(delta);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        let c = self.add_counter(name.to_string(), unit);
        c.set(value);
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|c| c.value())
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        let counter = self.add_timer(name);
        ScopedTimer::new(counter)
    }

    /// Sum of every counter with this name anywhere in the tree.
    pub fn sum_counter_values(&self, name: &str) -> i64 {
        let mut total = self.counter_value(name).unwrap_or(0);
        for child in self.children() {
            total = total.saturating_add(child.sum_counter_values(name));
        }
        total
    }

    /// First profile in the tree whose metadata equals `metadata` (preorder).
    pub fn find_by_metadata(&self, metadata: i64) -> Option<RuntimeProfile> {
        if self.metadata() == metadata {
            return Some(self.clone());
        }
        for child in self.children() {
            if let Some(found) = child.find_by_metadata(metadata) {
                return Some(found);
            }
        }
        None
    }

    /// Structural copy that shares nothing with the source tree.
    pub fn deep_clone(&self) -> RuntimeProfile {
        let copy = RuntimeProfile::new(self.name());
        copy.set_metadata(self.metadata());
        copy.copy_all_info_strings_from(self);
        copy.copy_all_counters_from(self);
        for child in self.children() {
            copy.add_child(child.deep_clone());
        }
        copy
    }

    /// Merges profiles with identical structure into one: sum-merged
    /// counters for quantity units, average-merged for time units, children
    /// merged recursively when present in every input.
    pub fn merge_isomorphic_profiles(profiles: &[RuntimeProfile]) -> RuntimeProfile {
        let first = profiles
            .first()
            .expect("merge_isomorphic_profiles requires non-empty input");

        let merged = RuntimeProfile::new(first.name());
        merged.set_metadata(first.metadata());
        merged.copy_all_info_strings_from(first);

        let all_counter_names: BTreeSet<String> = profiles
            .iter()
            .flat_map(|p| {
                p.inner
                    .counters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        for name in all_counter_names {
            let snapshots: Vec<CounterSnapshot> = profiles
                .iter()
                .filter_map(|p| p.counter_snapshot(&name))
                .collect();
            if snapshots.is_empty() {
                continue;
            }
            let unit = snapshots[0].unit;
            let values: Vec<i64> = snapshots.iter().map(|s| s.value).collect();
            let merged_value = merge_counter_values(merge_policy(unit), &values);
            let c = merged.add_counter(name, unit);
            c.set(merged_value);
        }

        for child in first.children() {
            let child_name = child.name();
            let mut child_profiles = Vec::with_capacity(profiles.len());
            for p in profiles {
                if let Some(c) = p.get_child(&child_name) {
                    child_profiles.push(c);
                }
            }
            if child_profiles.len() != profiles.len() {
                continue;
            }
            let merged_child = RuntimeProfile::merge_isomorphic_profiles(&child_profiles);
            merged.add_child(merged_child);
        }

        merged
    }

    /// Indented text rendering of the whole tree.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 0);
        out
    }

    fn pretty_print_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{}{}:", indent, self.name());
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (k, v) in info_strings {
            let _ = writeln!(out, "{}   {}: {}", indent, k, v);
        }
        let mut snapshots = self.counter_snapshots();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        for s in snapshots {
            let _ = writeln!(out, "{}   - {}: {} ({:?})", indent, s.name, s.value, s.unit);
        }
        for child in self.children() {
            child.pretty_print_into(out, depth + 1);
        }
    }

    fn counter_snapshot(&self, name: &str) -> Option<CounterSnapshot> {
        let guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let c = guard.get(name)?;
        Some(CounterSnapshot {
            name: c.name.clone(),
            unit: c.unit,
            value: c.value(),
        })
    }

    fn counter_snapshots(&self) -> Vec<CounterSnapshot> {
        let guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard
            .values()
            .map(|c| CounterSnapshot {
                name: c.name.clone(),
                unit: c.unit,
                value: c.value(),
            })
            .collect()
    }
}

pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
}

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ns = self.start.elapsed().as_nanos();
        let elapsed_ns = i64::try_from(elapsed_ns).unwrap_or(i64::MAX);
        self.counter.add(elapsed_ns);
    }
}

pub fn clamp_u128_to_i64(value: u128) -> i64 {
    if value > i64::MAX as u128 {
        i64::MAX
    } else {
        value as i64
    }
}

fn merge_counter_values(policy: MergePolicy, values: &[i64]) -> i64 {
    let n = i64::try_from(values.len()).unwrap_or(i64::MAX);
    let sum = values
        .iter()
        .copied()
        .fold(0i64, |acc, v| acc.saturating_add(v));
    match policy {
        MergePolicy::Sum => sum,
        MergePolicy::Avg => {
            if n <= 0 {
                0
            } else {
                sum / n
            }
        }
    }
}
