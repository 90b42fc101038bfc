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

use crate::addr::GuestVirtAddr;
use crate::config::HmConfig;
use crate::percpu::PhysCpuSlot;

/// The value the per-vcpu flush generation starts at, and wraps back to.
pub const GENERATION_RESET: u32 = 1;

/// How much of the translation caches must be invalidated before the next guest entry.
///
/// Ordered by strength, so pending requests can be combined with [`Ord::max`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlbFlushKind {
    /// Cached translations are still valid.
    None,
    /// Flush the translations of the vcpu's current tag.
    Tagged,
    /// Flush every tag on the physical CPU.
    Full,
}

/// What an invalidation primitive should flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbScope {
    /// All contexts on the physical CPU.
    All,
    /// All translations tagged with the given tag.
    Tag(u32),
    /// A single guest linear address within a tag.
    Address { tag: u32, addr: GuestVirtAddr },
}

/// Per-vcpu translation-cache state.
#[derive(Debug, Clone)]
pub struct TlbTagState {
    /// The tag the outer guest runs with. 0 until the first entry.
    pub tag: u32,
    /// The tag dedicated to the nested guest, if the platform provides one.
    pub nested_tag: Option<u32>,
    /// Bumped after every flush. Never decreases except when wrapping to
    /// [`GENERATION_RESET`].
    pub generation: u32,
    /// The physical CPU the tag was allocated on.
    pub last_cpu: Option<usize>,
    /// Generation of the physical CPU's tag space when the tag was allocated.
    pub cpu_flushes: u32,
    /// Flush requested before the next entry.
    pub pending: TlbFlushKind,
    /// Set when the last entry needed no flush: same CPU, same generation.
    pub fast_path: bool,
}

impl TlbTagState {
    const fn new() -> Self {
        Self {
            tag: 0,
            nested_tag: None,
            generation: GENERATION_RESET,
            last_cpu: None,
            cpu_flushes: 0,
            pending: TlbFlushKind::None,
            fast_path: false,
        }
    }
}

/// Decides when translation caches must be flushed and hands out address-space tags.
#[derive(Debug)]
pub struct TagManager {
    state: TlbTagState,
    tags_supported: bool,
    max_tag: u32,
    nested_tag_dedicated: bool,
    generation_limit: u32,
}

impl TagManager {
    /// Create a tag manager from the vcpu configuration.
    pub fn new(config: &HmConfig) -> Self {
        Self::with_generation_limit(config, u32::MAX)
    }

    /// Create a tag manager whose flush generation wraps after `limit`.
    pub fn with_generation_limit(config: &HmConfig, limit: u32) -> Self {
        Self {
            state: TlbTagState::new(),
            tags_supported: config.tags_supported,
            max_tag: config.max_tag,
            nested_tag_dedicated: config.tags_supported && config.nested_tag_dedicated,
            generation_limit: limit.max(GENERATION_RESET),
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> &TlbTagState {
        &self.state
    }

    /// The current flush generation.
    pub fn generation(&self) -> u32 {
        self.state.generation
    }

    /// The tag to run with in the given mode.
    pub fn active_tag(&self, nested: bool) -> u32 {
        match (nested, self.state.nested_tag) {
            (true, Some(tag)) => tag,
            _ => self.state.tag,
        }
    }

    /// Decide which flush the next entry on `current` needs, without changing any state.
    ///
    /// `cpu_flushes` is the tag-space generation of `current`.
    pub fn needs_flush(&self, current: usize, last: Option<usize>, cpu_flushes: u32) -> TlbFlushKind {
        if last != Some(current) {
            // Tags are per core; whatever we cached elsewhere means nothing here, and the
            // translations we left on this core earlier may be stale.
            return TlbFlushKind::Full;
        }
        if self.tags_supported && cpu_flushes != self.state.cpu_flushes {
            return TlbFlushKind::Full;
        }
        self.state.pending
    }

    /// Commit the flush decision for an entry on the CPU described by `slot`.
    ///
    /// Allocates a fresh tag when the vcpu migrated or the CPU recycled its tag space. The
    /// caller must perform the returned flush and then call [`TagManager::flush_done`]; until
    /// it does, the flush stays pending for the next entry.
    pub fn prepare_entry(&mut self, slot: &PhysCpuSlot) -> TlbFlushKind {
        let current = slot.cpu_id();
        let mut kind = self.needs_flush(current, self.state.last_cpu, slot.tlb_flushes());

        if self.tags_supported
            && (self.state.last_cpu != Some(current) || slot.tlb_flushes() != self.state.cpu_flushes)
        {
            let (tag, wrapped) = slot.allocate_tag(self.max_tag);
            self.state.tag = tag;
            if self.nested_tag_dedicated {
                let (nested, nested_wrapped) = slot.allocate_tag(self.max_tag);
                self.state.nested_tag = Some(nested);
                if nested_wrapped {
                    // The outer tag was allocated in the previous generation.
                    self.state.tag = slot.allocate_tag(self.max_tag).0;
                }
            }
            if wrapped || slot.flush_tag_before_use() {
                kind = TlbFlushKind::Full;
            }
            self.state.cpu_flushes = slot.tlb_flushes();
            debug!(
                "tag {} (nested {:?}) allocated on CPU {}, generation {}",
                self.state.tag, self.state.nested_tag, current, self.state.cpu_flushes
            );
        }

        self.state.last_cpu = Some(current);
        self.state.fast_path = kind == TlbFlushKind::None;
        // Stays requested until `flush_done`, so a failed flush is retried.
        self.state.pending = self.state.pending.max(kind);
        kind
    }

    /// The invalidation scope implementing `kind` for the given mode.
    pub fn scope_for(&self, kind: TlbFlushKind, nested: bool) -> Option<TlbScope> {
        match kind {
            TlbFlushKind::None => None,
            TlbFlushKind::Tagged if self.tags_supported => Some(TlbScope::Tag(self.active_tag(nested))),
            _ => Some(TlbScope::All),
        }
    }

    /// Record that a flush of `kind` was performed on `slot`.
    pub fn flush_done(&mut self, kind: TlbFlushKind, slot: &PhysCpuSlot) {
        if kind == TlbFlushKind::None {
            return;
        }
        if kind == TlbFlushKind::Full {
            slot.tags_flushed();
        }
        self.state.pending = TlbFlushKind::None;
        self.bump_generation();
    }

    fn bump_generation(&mut self) {
        if self.state.generation >= self.generation_limit {
            self.state.generation = GENERATION_RESET;
            // Anything keyed on the old generation can no longer be told apart.
            self.state.pending = TlbFlushKind::Full;
            debug!("TLB flush generation wrapped");
        } else {
            self.state.generation += 1;
        }
    }

    /// Request a flush before the next entry. Never weakens an already pending request.
    pub fn flush_on_next_entry(&mut self, kind: TlbFlushKind) {
        self.state.pending = self.state.pending.max(kind);
    }

    /// The guest switched between the outer and the nested context.
    pub fn nested_switch(&mut self) {
        if !self.nested_tag_dedicated {
            self.flush_on_next_entry(TlbFlushKind::Tagged);
        }
    }

    /// Invalidate a single guest page, on behalf of a caller running on `current_cpu`.
    ///
    /// Returns the scope the caller must invalidate right now, or `None` when the request was
    /// turned into a tagged flush before the next entry. Only the CPU holding the tag can
    /// invalidate a single address.
    pub fn invalidate_page(
        &mut self,
        addr: GuestVirtAddr,
        nested: bool,
        current_cpu: usize,
    ) -> Option<TlbScope> {
        if self.tags_supported && self.state.last_cpu == Some(current_cpu) {
            Some(TlbScope::Address {
                tag: self.active_tag(nested),
                addr,
            })
        } else {
            self.flush_on_next_entry(TlbFlushKind::Tagged);
            None
        }
    }

    /// Forget everything. Used on a full VM reset.
    pub fn reset(&mut self) {
        self.state = TlbTagState::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::percpu::PhysCpuRegistry;

    fn manager(config: HmConfig) -> TagManager {
        TagManager::new(&config)
    }

    #[test]
    fn migration_always_forces_full_flush() {
        let tags = manager(HmConfig::default());
        for last in [None, Some(0), Some(2)] {
            for generation in 0..4 {
                if last != Some(1) {
                    assert_eq!(tags.needs_flush(1, last, generation), TlbFlushKind::Full);
                }
            }
        }
    }

    #[test]
    fn same_cpu_takes_the_fast_path() {
        let registry = PhysCpuRegistry::new(2);
        let slot = registry.slot(0).unwrap();
        let mut tags = manager(HmConfig::default());
        assert_eq!(tags.prepare_entry(slot), TlbFlushKind::Full);
        tags.flush_done(TlbFlushKind::Full, slot);
        assert_eq!(tags.prepare_entry(slot), TlbFlushKind::None);
        assert!(tags.state().fast_path);
        let tag = tags.active_tag(false);
        assert_eq!(tags.prepare_entry(slot), TlbFlushKind::None);
        assert_eq!(tags.active_tag(false), tag);
    }

    #[test]
    fn migration_allocates_a_new_tag() {
        let registry = PhysCpuRegistry::new(2);
        let mut tags = manager(HmConfig::default());
        let first = registry.slot(0).unwrap();
        tags.prepare_entry(first);
        tags.flush_done(TlbFlushKind::Full, first);
        let second = registry.slot(1).unwrap();
        assert_eq!(tags.prepare_entry(second), TlbFlushKind::Full);
        assert_eq!(tags.state().last_cpu, Some(1));
    }

    #[test]
    fn tag_wraparound_forces_full_flush() {
        let config = HmConfig {
            max_tag: 2,
            ..HmConfig::default()
        };
        let registry = PhysCpuRegistry::new(1);
        let slot = registry.slot(0).unwrap();
        let mut a = manager(config.clone());
        let mut b = manager(config.clone());
        a.prepare_entry(slot);
        a.flush_done(TlbFlushKind::Full, slot);
        b.prepare_entry(slot);
        b.flush_done(TlbFlushKind::Full, slot);
        assert_eq!(a.active_tag(false), 1);
        assert_eq!(b.active_tag(false), 2);

        // A third context on the same CPU exhausts the tag space.
        let mut c = manager(config);
        c.state.last_cpu = Some(0);
        c.state.cpu_flushes = slot.tlb_flushes() + 5;
        assert_eq!(c.prepare_entry(slot), TlbFlushKind::Full);
        assert_eq!(c.active_tag(false), 1);
        c.flush_done(TlbFlushKind::Full, slot);

        // `a` notices the recycled tag space through the CPU generation.
        assert_eq!(a.prepare_entry(slot), TlbFlushKind::Full);
    }

    #[test]
    fn nested_switch_needs_a_tagged_flush_without_dedicated_tag() {
        let registry = PhysCpuRegistry::new(1);
        let slot = registry.slot(0).unwrap();
        let mut tags = manager(HmConfig::default());
        tags.prepare_entry(slot);
        tags.flush_done(TlbFlushKind::Full, slot);
        tags.nested_switch();
        let kind = tags.prepare_entry(slot);
        assert_eq!(kind, TlbFlushKind::Tagged);
        assert_eq!(tags.scope_for(kind, true), Some(TlbScope::Tag(tags.active_tag(true))));

        let mut dedicated = manager(HmConfig {
            nested_tag_dedicated: true,
            ..HmConfig::default()
        });
        dedicated.prepare_entry(slot);
        dedicated.flush_done(TlbFlushKind::Full, slot);
        dedicated.nested_switch();
        assert_eq!(dedicated.prepare_entry(slot), TlbFlushKind::None);
        assert_ne!(dedicated.active_tag(true), dedicated.active_tag(false));
    }

    #[test]
    fn page_invalidation_escalates_without_tags() {
        let registry = PhysCpuRegistry::new(1);
        let slot = registry.slot(0).unwrap();
        let addr = GuestVirtAddr::from_usize(0x7000);

        let mut tagged = manager(HmConfig::default());
        tagged.prepare_entry(slot);
        assert!(matches!(
            tagged.invalidate_page(addr, false, 0),
            Some(TlbScope::Address { .. })
        ));

        let mut untagged = manager(HmConfig {
            tags_supported: false,
            ..HmConfig::default()
        });
        untagged.prepare_entry(slot);
        untagged.flush_done(TlbFlushKind::Full, slot);
        assert_eq!(untagged.invalidate_page(addr, false, 0), None);
        let kind = untagged.prepare_entry(slot);
        assert_eq!(kind, TlbFlushKind::Tagged);
        assert_eq!(untagged.scope_for(kind, false), Some(TlbScope::All));
    }

    #[test]
    fn generation_is_monotonic_and_wraps_to_reset() {
        let registry = PhysCpuRegistry::new(1);
        let slot = registry.slot(0).unwrap();
        let mut tags = TagManager::with_generation_limit(&HmConfig::default(), 5);
        tags.prepare_entry(slot);
        let mut previous = tags.generation();
        let mut wrapped = false;
        for _ in 0..12 {
            tags.flush_on_next_entry(TlbFlushKind::Tagged);
            let kind = tags.prepare_entry(slot);
            assert_ne!(kind, TlbFlushKind::None);
            if wrapped {
                // The wrap requested a full flush for this entry.
                assert_eq!(kind, TlbFlushKind::Full);
                wrapped = false;
            }
            tags.flush_done(kind, slot);
            let now = tags.generation();
            if now < previous {
                assert_eq!(now, GENERATION_RESET);
                assert_eq!(tags.state().pending, TlbFlushKind::Full);
                wrapped = true;
            } else {
                assert_eq!(now, previous + 1);
            }
            previous = now;
        }
    }

    #[test]
    fn unfinished_flush_is_repeated_on_the_next_entry() {
        let registry = PhysCpuRegistry::new(2);
        let mut tags = manager(HmConfig::default());
        let first = registry.slot(0).unwrap();
        tags.prepare_entry(first);
        tags.flush_done(TlbFlushKind::Full, first);

        // Migrated, but the flush never ran.
        let second = registry.slot(1).unwrap();
        assert_eq!(tags.prepare_entry(second), TlbFlushKind::Full);
        assert_eq!(tags.state().pending, TlbFlushKind::Full);
        assert_eq!(tags.prepare_entry(second), TlbFlushKind::Full);
        tags.flush_done(TlbFlushKind::Full, second);
        assert_eq!(tags.prepare_entry(second), TlbFlushKind::None);
    }

    #[test]
    fn page_invalidation_from_another_cpu_escalates() {
        let registry = PhysCpuRegistry::new(2);
        let slot = registry.slot(0).unwrap();
        let mut tags = manager(HmConfig::default());
        tags.prepare_entry(slot);
        tags.flush_done(TlbFlushKind::Full, slot);

        let addr = GuestVirtAddr::from_usize(0x9000);
        assert_eq!(tags.invalidate_page(addr, false, 1), None);
        assert_eq!(tags.state().pending, TlbFlushKind::Tagged);
        let kind = tags.prepare_entry(slot);
        assert_eq!(kind, TlbFlushKind::Tagged);
        assert_eq!(
            tags.scope_for(kind, false),
            Some(TlbScope::Tag(tags.active_tag(false)))
        );
    }

    #[test]
    fn pending_requests_are_never_weakened() {
        let mut tags = manager(HmConfig::default());
        tags.flush_on_next_entry(TlbFlushKind::Full);
        tags.flush_on_next_entry(TlbFlushKind::Tagged);
        tags.nested_switch();
        assert_eq!(tags.state().pending, TlbFlushKind::Full);
    }
}
