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
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};

/// The first address-space tag handed out to guests. Tag 0 belongs to the host.
pub const FIRST_GUEST_TAG: u32 = 1;

/// Lifecycle of a physical CPU with respect to hardware virtualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PhysCpuState {
    /// Virtualization is not enabled on this CPU.
    Unconfigured = 0,
    /// Virtualization is enabled and no vcpu is running on this CPU.
    Configured = 1,
    /// A vcpu owns this CPU for a world switch.
    InUse = 2,
    /// The CPU is being taken out of service (e.g. power suspend).
    Suspending = 3,
}

impl PhysCpuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Configured,
            2 => Self::InUse,
            3 => Self::Suspending,
            _ => Self::Unconfigured,
        }
    }
}

/// Per physical CPU virtualization state.
///
/// Everything in here may be touched by any thread, so all of it is atomic.
#[derive(Debug)]
pub struct PhysCpuSlot {
    cpu_id: usize,
    state: AtomicU8,
    /// The last tag handed out on this CPU.
    current_tag: AtomicU32,
    /// Number of times the tag space of this CPU was recycled.
    tlb_flushes: AtomicU32,
    /// Tags recycled after a wraparound may still have stale translations in the TLB.
    flush_tag_before_use: AtomicBool,
}

impl PhysCpuSlot {
    fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            state: AtomicU8::new(PhysCpuState::Unconfigured as u8),
            current_tag: AtomicU32::new(FIRST_GUEST_TAG - 1),
            tlb_flushes: AtomicU32::new(0),
            flush_tag_before_use: AtomicBool::new(false),
        }
    }

    /// The id of this physical CPU.
    pub const fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PhysCpuState {
        PhysCpuState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// The tag-space generation of this CPU.
    pub fn tlb_flushes(&self) -> u32 {
        self.tlb_flushes.load(Ordering::Acquire)
    }

    /// Whether a freshly allocated tag has to be flushed before use.
    pub fn flush_tag_before_use(&self) -> bool {
        self.flush_tag_before_use.load(Ordering::Acquire)
    }

    /// Allocate a new address-space tag on this CPU.
    ///
    /// Returns the tag and whether the tag space wrapped. On wraparound every tag on this CPU
    /// may hold stale translations, so the generation is bumped and new tags are flushed before
    /// their first use.
    ///
    /// Only the vcpu currently owning this CPU allocates tags, so there is no contention here.
    pub(crate) fn allocate_tag(&self, max_tag: u32) -> (u32, bool) {
        let next = self.current_tag.load(Ordering::Relaxed).wrapping_add(1);
        if next > max_tag || next < FIRST_GUEST_TAG {
            self.current_tag.store(FIRST_GUEST_TAG, Ordering::Relaxed);
            self.tlb_flushes.fetch_add(1, Ordering::AcqRel);
            self.flush_tag_before_use.store(true, Ordering::Release);
            (FIRST_GUEST_TAG, true)
        } else {
            self.current_tag.store(next, Ordering::Relaxed);
            (next, false)
        }
    }

    /// Called after the whole tag space of this CPU was flushed.
    pub(crate) fn tags_flushed(&self) {
        self.flush_tag_before_use.store(false, Ordering::Release);
    }

    fn transition(&self, from: PhysCpuState, to: PhysCpuState) -> Result<(), PhysCpuState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PhysCpuState::from_raw)
    }
}

/// Outcome of an attempt to claim a physical CPU for a world switch.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// Virtualization is not (or no longer) enabled on the CPU. The slice must be abandoned.
    NotConfigured,
    /// Another vcpu already owns the CPU. This is a programming error.
    AlreadyClaimed,
    /// No such CPU.
    OutOfRange,
}

/// Process-wide arena of per physical CPU virtualization state.
///
/// Sized to the detected number of logical CPUs and addressed by CPU index. There is no global
/// lock: every slot is an independent atomic state machine, so a CPU can be suspended while
/// other CPUs keep running guests.
///
/// Recommended usage: create one registry at hypervisor start-up, share it through an
/// [`Arc`](alloc::sync::Arc) with every vcpu, and [`configure`](Self::configure) each CPU
/// after enabling the virtualization extension on it.
#[derive(Debug)]
pub struct PhysCpuRegistry {
    slots: Vec<PhysCpuSlot>,
}

impl PhysCpuRegistry {
    /// Create a registry for `cpu_count` physical CPUs, all unconfigured.
    pub fn new(cpu_count: usize) -> Self {
        Self {
            slots: (0..cpu_count).map(PhysCpuSlot::new).collect(),
        }
    }

    /// Number of physical CPUs.
    pub fn cpu_count(&self) -> usize {
        self.slots.len()
    }

    /// The slot of `cpu_id`.
    pub fn slot(&self, cpu_id: usize) -> AxResult<&PhysCpuSlot> {
        self.slots
            .get(cpu_id)
            .ok_or_else(|| ax_err_type!(InvalidInput, "physical CPU index out of range"))
    }

    /// Mark `cpu_id` as having virtualization enabled.
    pub fn configure(&self, cpu_id: usize) -> AxResult {
        let slot = self.slot(cpu_id)?;
        match slot.transition(PhysCpuState::Unconfigured, PhysCpuState::Configured) {
            Ok(()) => {
                debug!("physical CPU {} configured for virtualization", cpu_id);
                Ok(())
            }
            Err(PhysCpuState::Configured) => Ok(()),
            Err(state) => ax_err!(
                BadState,
                format!("cannot configure physical CPU {} in state {:?}", cpu_id, state)
            ),
        }
    }

    /// Take `cpu_id` out of service.
    ///
    /// Fails with `ResourceBusy` while a vcpu is mid world switch on it; the caller retries once
    /// the slice is over. A suspended CPU must be reconfigured before it can run guests again.
    pub fn suspend(&self, cpu_id: usize) -> AxResult {
        let slot = self.slot(cpu_id)?;
        match slot.transition(PhysCpuState::Configured, PhysCpuState::Suspending) {
            Ok(()) => {
                // Tags are not preserved across a suspend.
                slot.current_tag.store(FIRST_GUEST_TAG - 1, Ordering::Relaxed);
                slot.tlb_flushes.fetch_add(1, Ordering::AcqRel);
                slot.flush_tag_before_use.store(true, Ordering::Release);
                slot.state
                    .store(PhysCpuState::Unconfigured as u8, Ordering::Release);
                debug!("physical CPU {} suspended", cpu_id);
                Ok(())
            }
            Err(PhysCpuState::Unconfigured) => Ok(()),
            Err(PhysCpuState::InUse) => ax_err!(ResourceBusy, "physical CPU is in use"),
            Err(state) => ax_err!(
                BadState,
                format!("cannot suspend physical CPU {} in state {:?}", cpu_id, state)
            ),
        }
    }

    /// Claim `cpu_id` for one world switch.
    pub fn claim(&self, cpu_id: usize) -> Result<PhysCpuClaim<'_>, ClaimError> {
        let slot = self.slots.get(cpu_id).ok_or(ClaimError::OutOfRange)?;
        match slot.transition(PhysCpuState::Configured, PhysCpuState::InUse) {
            Ok(()) => Ok(PhysCpuClaim { slot }),
            Err(PhysCpuState::InUse) => Err(ClaimError::AlreadyClaimed),
            Err(_) => Err(ClaimError::NotConfigured),
        }
    }
}

/// Exclusive ownership of a physical CPU for the duration of a world switch.
///
/// Dropping the claim hands the CPU back.
#[derive(Debug)]
pub struct PhysCpuClaim<'a> {
    slot: &'a PhysCpuSlot,
}

impl PhysCpuClaim<'_> {
    /// The claimed slot.
    pub fn slot(&self) -> &PhysCpuSlot {
        self.slot
    }
}

impl Drop for PhysCpuClaim<'_> {
    fn drop(&mut self) {
        if self
            .slot
            .transition(PhysCpuState::InUse, PhysCpuState::Configured)
            .is_err()
        {
            error!(
                "physical CPU {} changed state while claimed",
                self.slot.cpu_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn claim_requires_configuration() {
        let registry = PhysCpuRegistry::new(2);
        assert_eq!(registry.claim(0).unwrap_err(), ClaimError::NotConfigured);
        assert_eq!(registry.claim(7).unwrap_err(), ClaimError::OutOfRange);
        registry.configure(0).unwrap();
        let claim = registry.claim(0).unwrap();
        assert_eq!(claim.slot().state(), PhysCpuState::InUse);
        assert_eq!(registry.claim(0).unwrap_err(), ClaimError::AlreadyClaimed);
        drop(claim);
        assert_eq!(registry.slot(0).unwrap().state(), PhysCpuState::Configured);
    }

    #[test]
    fn suspend_waits_for_the_running_vcpu() {
        let registry = PhysCpuRegistry::new(1);
        registry.configure(0).unwrap();
        let claim = registry.claim(0).unwrap();
        assert_eq!(
            registry.suspend(0).unwrap_err(),
            axerrno::AxError::ResourceBusy
        );
        drop(claim);
        let before = registry.slot(0).unwrap().tlb_flushes();
        registry.suspend(0).unwrap();
        let slot = registry.slot(0).unwrap();
        assert_eq!(slot.state(), PhysCpuState::Unconfigured);
        assert!(slot.tlb_flushes() > before);
        assert!(slot.flush_tag_before_use());
        assert_eq!(registry.claim(0).unwrap_err(), ClaimError::NotConfigured);
    }

    #[test]
    fn tag_allocation_wraps_and_bumps_generation() {
        let registry = PhysCpuRegistry::new(1);
        let slot = registry.slot(0).unwrap();
        assert_eq!(slot.allocate_tag(3), (1, false));
        assert_eq!(slot.allocate_tag(3), (2, false));
        assert_eq!(slot.allocate_tag(3), (3, false));
        assert_eq!(slot.allocate_tag(3), (FIRST_GUEST_TAG, true));
        assert_eq!(slot.tlb_flushes(), 1);
        assert!(slot.flush_tag_before_use());
        slot.tags_flushed();
        assert!(!slot.flush_tag_before_use());
    }

    #[test]
    fn concurrent_claims_never_double_own() {
        let registry = Arc::new(PhysCpuRegistry::new(1));
        registry.configure(0).unwrap();
        let owners = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let owners = owners.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(claim) = registry.claim(0) {
                            assert_eq!(owners.fetch_add(1, Ordering::SeqCst), 0);
                            owners.fetch_sub(1, Ordering::SeqCst);
                            drop(claim);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.slot(0).unwrap().state(), PhysCpuState::Configured);
    }
}
