// Copyright 2025 The Axvisor Team
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

use alloc::vec::Vec;

const SETS: usize = 64;
const WAYS: usize = 4;
const DETAILS: usize = 256;

/// Identifies a recurring exit: where it happened and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitKey {
    pub rip: u64,
    pub reason: u32,
}

impl ExitKey {
    pub const fn new(rip: u64, reason: u32) -> Self {
        Self { rip, reason }
    }

    fn hash(&self) -> u64 {
        // FNV-1a over rip and reason.
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in self
            .rip
            .to_le_bytes()
            .into_iter()
            .chain(self.reason.to_le_bytes())
        {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }
}

/// One slot of the history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitHistoryEntry {
    pub key: Option<ExitKey>,
    /// How often the key was recorded since it got this slot.
    pub hits: u32,
    /// Recency stamp; the smallest in a set is evicted first.
    pub last_hit: u64,
    /// Index of the most recent detail record for this key.
    pub detail: u16,
}

/// Detail of one recorded exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitDetail {
    pub key: Option<ExitKey>,
    pub timestamp: u64,
}

/// Bounded, aging record of recent exits.
///
/// Set associative: a key hashes to one set of four slots; on a miss in a full set the
/// least recently hit slot is recycled. Nothing in here affects correctness. Dropping or
/// clearing the history only costs performance.
#[derive(Debug, Clone)]
pub struct ExitHistory {
    entries: Vec<ExitHistoryEntry>,
    details: Vec<ExitDetail>,
    next_detail: usize,
    tick: u64,
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self {
            entries: vec![ExitHistoryEntry::default(); SETS * WAYS],
            details: vec![ExitDetail::default(); DETAILS],
            next_detail: 0,
            tick: 0,
        }
    }

    fn set_of(&self, key: &ExitKey) -> core::ops::Range<usize> {
        let set = (key.hash() % SETS as u64) as usize;
        set * WAYS..(set + 1) * WAYS
    }

    /// Record an occurrence of `key` at `timestamp` and return its hit count.
    pub fn record(&mut self, key: ExitKey, timestamp: u64) -> u32 {
        self.tick += 1;
        let detail = self.next_detail;
        self.details[detail] = ExitDetail {
            key: Some(key),
            timestamp,
        };
        self.next_detail = (detail + 1) % DETAILS;

        let range = self.set_of(&key);
        let tick = self.tick;
        let set = &mut self.entries[range];
        let slot = match set.iter().position(|entry| entry.key == Some(key)) {
            Some(hit) => hit,
            None => {
                let victim = set
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| (entry.key.is_some(), entry.last_hit))
                    .map(|(index, _)| index)
                    .unwrap_or(0);
                set[victim] = ExitHistoryEntry {
                    key: Some(key),
                    hits: 0,
                    last_hit: 0,
                    detail: 0,
                };
                victim
            }
        };
        let entry = &mut set[slot];
        entry.hits = entry.hits.saturating_add(1);
        entry.last_hit = tick;
        entry.detail = detail as u16;
        entry.hits
    }

    /// How often `key` was recorded, 0 if unknown or aged out.
    pub fn lookup(&self, key: ExitKey) -> u32 {
        self.entries[self.set_of(&key)]
            .iter()
            .find(|entry| entry.key == Some(key))
            .map_or(0, |entry| entry.hits)
    }

    /// The most recent detail record of `key`.
    pub fn last_detail(&self, key: ExitKey) -> Option<ExitDetail> {
        self.entries[self.set_of(&key)]
            .iter()
            .find(|entry| entry.key == Some(key))
            .map(|entry| self.details[entry.detail as usize])
            .filter(|detail| detail.key == Some(key))
    }

    /// Occupied slots.
    pub fn entries(&self) -> impl Iterator<Item = &ExitHistoryEntry> {
        self.entries.iter().filter(|entry| entry.key.is_some())
    }

    /// Number of distinct keys currently remembered.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.fill(ExitHistoryEntry::default());
        self.details.fill(ExitDetail::default());
        self.next_detail = 0;
        self.tick = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_accumulate_per_key() {
        let mut history = ExitHistory::new();
        let key = ExitKey::new(0xffff_8000_0000_1000, 10);
        assert_eq!(history.lookup(key), 0);
        assert_eq!(history.record(key, 1), 1);
        assert_eq!(history.record(key, 2), 2);
        assert_eq!(history.lookup(key), 2);
        assert_eq!(history.lookup(ExitKey::new(0xffff_8000_0000_1000, 12)), 0);
        assert_eq!(history.last_detail(key).unwrap().timestamp, 2);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn collisions_evict_the_least_recently_hit() {
        let mut history = ExitHistory::new();
        // Find five keys that land in the same set.
        let first = ExitKey::new(0, 1);
        let target = history.set_of(&first);
        let mut keys = vec![first];
        let mut rip = 1;
        while keys.len() < WAYS + 1 {
            let key = ExitKey::new(rip, 1);
            if history.set_of(&key) == target {
                keys.push(key);
            }
            rip += 1;
        }

        for key in &keys[..WAYS] {
            history.record(*key, 0);
        }
        // Keep everything but the second key warm.
        for key in keys[..WAYS].iter().filter(|key| **key != keys[1]) {
            history.record(*key, 0);
        }
        history.record(keys[WAYS], 0);

        assert_eq!(history.lookup(keys[1]), 0);
        assert_eq!(history.lookup(keys[0]), 2);
        assert_eq!(history.lookup(keys[WAYS]), 1);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut history = ExitHistory::new();
        for rip in 0..100 {
            history.record(ExitKey::new(rip, 48), rip);
        }
        assert!(!history.is_empty());
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.lookup(ExitKey::new(5, 48)), 0);
    }
}
