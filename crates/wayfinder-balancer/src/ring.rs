// Copyright 2025 Wayfinder Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Ring positions derived from each point's SHA-256 digest.
pub const POSITIONS_PER_POINT: usize = 8;

/// Immutable consistent-hash ring.
///
/// Each endpoint owns as many points as the strategy granted it; every point
/// is placed at [`POSITIONS_PER_POINT`] positions cut from one digest of
/// `"{uri}-{point}"`. A lookup walks clockwise to the first position at or
/// after the request hash, wrapping past `u32::MAX`.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: BTreeMap<String, u32>,
    uris: Vec<String>,
    /// Sorted by hash; the second field indexes `uris`
    positions: Vec<(u32, usize)>,
}

impl Ring {
    /// Builds a ring from endpoint point counts; zero counts are left out.
    pub fn new(points: BTreeMap<String, u32>) -> Self {
        let points: BTreeMap<String, u32> = points.into_iter().filter(|(_, p)| *p > 0).collect();
        let uris: Vec<String> = points.keys().cloned().collect();

        let total: usize = points.values().map(|p| *p as usize).sum();
        let mut positions = Vec::with_capacity(total * POSITIONS_PER_POINT);
        for (index, (uri, count)) in points.iter().enumerate() {
            for point in 0..*count {
                let digest = Sha256::digest(format!("{}-{}", uri, point).as_bytes());
                for chunk in digest.chunks_exact(4) {
                    let hash = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    positions.push((hash, index));
                }
            }
        }
        positions.sort_unstable();

        Self {
            points,
            uris,
            positions,
        }
    }

    /// Hash of an arbitrary request key.
    pub fn hash_key(key: &[u8]) -> u32 {
        let digest = Sha256::digest(key);
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Endpoint URI -> point count, without zero entries.
    pub fn points(&self) -> &BTreeMap<String, u32> {
        &self.points
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.points.contains_key(uri)
    }

    pub fn endpoint_count(&self) -> usize {
        self.uris.len()
    }

    fn start_index(&self, hash: u32) -> usize {
        let index = self.positions.partition_point(|(h, _)| *h < hash);
        if index == self.positions.len() { 0 } else { index }
    }

    /// Endpoint owning `hash`.
    pub fn get(&self, hash: u32) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let (_, uri) = self.positions[self.start_index(hash)];
        Some(&self.uris[uri])
    }

    /// Distinct endpoints in clockwise order starting at `hash`.
    pub fn iter_from(&self, hash: u32) -> RingIter<'_> {
        RingIter {
            ring: self,
            next: self.start_index(hash),
            visited: 0,
            seen: HashSet::new(),
        }
    }
}

impl PartialEq for Ring {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points
    }
}

/// Iterator over the distinct endpoints of a [`Ring`], see [`Ring::iter_from`].
pub struct RingIter<'a> {
    ring: &'a Ring,
    next: usize,
    visited: usize,
    seen: HashSet<usize>,
}

impl<'a> Iterator for RingIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.ring.positions.len();
        while self.visited < len && self.seen.len() < self.ring.uris.len() {
            let (_, uri) = self.ring.positions[self.next];
            self.next = (self.next + 1) % len;
            self.visited += 1;
            if self.seen.insert(uri) {
                return Some(&self.ring.uris[uri]);
            }
        }
        None
    }
}
