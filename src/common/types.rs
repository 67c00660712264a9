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

/// 128-bit identifier for queries and fragment instances, stored as two
/// signed halves so it round-trips through planner payloads unchanged.
///
/// Fragment instance ids are derived from the query id by offsetting `lo`,
/// so all ids of one query share the same `hi` half. Displays in the
/// 8-4-4-4-12 UUID layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Id for the `n`-th derived instance of this query.
    pub fn offset_lo(self, n: i64) -> Self {
        Self {
            hi: self.hi,
            lo: self.lo.wrapping_add(n),
        }
    }

    /// The id as one unsigned 128-bit value, `hi` in the upper half.
    fn as_u128(self) -> u128 {
        ((self.hi as u64 as u128) << 64) | (self.lo as u64 as u128)
    }

    pub fn to_uuid_string(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // UUID text layout: group widths 8-4-4-4-12, 32 hex digits total.
        let bits = self.as_u128();
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (bits >> 96) as u32,
            (bits >> 80) as u16,
            (bits >> 64) as u16,
            (bits >> 48) as u16,
            (bits as u64) & 0xffff_ffff_ffff
        )
    }
}

/// Address of a backend endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NetworkAddress {
    pub hostname: String,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}
