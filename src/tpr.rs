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

use alloc::collections::BTreeMap;

use axerrno::{AxResult, ax_err};
use memory_addr::{MemoryAddr, PAGE_SIZE_4K};

use crate::addr::GuestVirtAddr;

/// Maximum number of patches per vcpu.
pub const MAX_TPR_PATCHES: usize = 64;

/// Longest instruction the table can hold.
pub const MAX_INSTR_LEN: usize = 15;

/// What a patched instruction did with the task-priority register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TprPatchKind {
    /// `mov reg, [tpr]`
    Read,
    /// `mov reg, [tpr]` followed by `shr reg, 4`
    ReadShr4,
    /// `mov [tpr], reg`
    WriteReg,
    /// `mov [tpr], imm32`
    WriteImm,
    /// The instruction was replaced by a jump to a patch block.
    JumpReplacement,
}

/// Raw instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrBytes {
    bytes: [u8; MAX_INSTR_LEN],
    len: u8,
}

impl InstrBytes {
    /// Copy `bytes`, `None` if longer than an instruction can be.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_INSTR_LEN {
            return None;
        }
        let mut buf = [0; MAX_INSTR_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len as usize
    }
}

/// One patched guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TprPatch {
    pub addr: GuestVirtAddr,
    pub original: InstrBytes,
    pub replacement: InstrBytes,
    pub kind: TprPatchKind,
    /// General register index (or the immediate for [`TprPatchKind::WriteImm`]).
    pub operand: u32,
    /// Faults taken on this address since the patch was installed.
    pub fault_count: u32,
}

impl TprPatch {
    pub fn new(
        addr: GuestVirtAddr,
        original: InstrBytes,
        replacement: InstrBytes,
        kind: TprPatchKind,
        operand: u32,
    ) -> Self {
        Self {
            addr,
            original,
            replacement,
            kind,
            operand,
            fault_count: 0,
        }
    }

    /// First address past the patched bytes. Saturates at the top of the address space.
    pub fn end(&self) -> usize {
        self.addr.as_usize().saturating_add(self.original.len())
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.addr.as_usize() < end && start < self.end()
    }
}

/// Patches of one vcpu, ordered by guest address.
#[derive(Debug, Default)]
pub struct TprPatchTable {
    patches: BTreeMap<GuestVirtAddr, TprPatch>,
}

impl TprPatchTable {
    pub const fn new() -> Self {
        Self {
            patches: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// The patch starting at `addr`.
    pub fn lookup(&self, addr: GuestVirtAddr) -> Option<&TprPatch> {
        self.patches.get(&addr)
    }

    /// The patch whose bytes contain `addr`.
    pub fn covering(&self, addr: GuestVirtAddr) -> Option<&TprPatch> {
        self.patches
            .range(..=addr)
            .next_back()
            .map(|(_, patch)| patch)
            .filter(|patch| patch.overlaps(addr.as_usize(), addr.as_usize().saturating_add(1)))
    }

    /// Install `patch`.
    ///
    /// Fails with `AlreadyExists` if an existing patch covers any of its bytes and leaves the
    /// existing patch untouched.
    pub fn insert(&mut self, patch: TprPatch) -> AxResult {
        let (start, end) = (patch.addr.as_usize(), patch.end());
        let clash = self
            .patches
            .range(..GuestVirtAddr::from_usize(end))
            .next_back()
            .is_some_and(|(_, existing)| existing.overlaps(start, end));
        if clash {
            return ax_err!(AlreadyExists, "TPR patch address already covered");
        }
        if self.patches.len() >= MAX_TPR_PATCHES {
            return ax_err!(NoMemory, "TPR patch table full");
        }
        debug!("TPR patch {:?} at {:?}", patch.kind, patch.addr);
        self.patches.insert(patch.addr, patch);
        Ok(())
    }

    /// Remove the patch starting at `addr`.
    pub fn remove(&mut self, addr: GuestVirtAddr) -> Option<TprPatch> {
        self.patches.remove(&addr)
    }

    /// Count a fault on the patch covering `addr` and return the new count.
    pub fn record_fault(&mut self, addr: GuestVirtAddr) -> Option<u32> {
        let start = self.covering(addr)?.addr;
        let patch = self.patches.get_mut(&start)?;
        patch.fault_count = patch.fault_count.saturating_add(1);
        Some(patch.fault_count)
    }

    /// Drop every patch overlapping `[start, start + len)`. Returns how many were dropped.
    pub fn invalidate_range(&mut self, start: GuestVirtAddr, len: usize) -> usize {
        let (lo, hi) = (start.as_usize(), start.as_usize().saturating_add(len));
        let before = self.patches.len();
        // A patch starting below `lo` can still reach into the range.
        self.patches.retain(|_, patch| !patch.overlaps(lo, hi));
        let dropped = before - self.patches.len();
        if dropped > 0 {
            debug!("dropped {} TPR patches in {:?}+{:#x}", dropped, start, len);
        }
        dropped
    }

    /// Drop every patch on the 4K page containing `addr`.
    pub fn invalidate_page(&mut self, addr: GuestVirtAddr) -> usize {
        self.invalidate_range(addr.align_down_4k(), PAGE_SIZE_4K)
    }

    pub fn clear(&mut self) {
        self.patches.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TprPatch> {
        self.patches.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(addr: usize, len: usize, kind: TprPatchKind) -> TprPatch {
        let original = [0x8b, 0x05, 0x80, 0x00, 0xe0, 0xfe, 0x90, 0x90];
        TprPatch::new(
            GuestVirtAddr::from_usize(addr),
            InstrBytes::new(&original[..len]).unwrap(),
            InstrBytes::new(&[0xf0, 0x0f, 0x20, 0xc0, 0x90, 0x90][..len.min(6)]).unwrap(),
            kind,
            0,
        )
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut table = TprPatchTable::new();
        let first = patch(0x1000, 6, TprPatchKind::Read);
        table.insert(first).unwrap();

        let err = table.insert(patch(0x1000, 5, TprPatchKind::WriteImm));
        assert_eq!(err, ax_err!(AlreadyExists));
        assert_eq!(table.lookup(GuestVirtAddr::from_usize(0x1000)), Some(&first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn overlapping_patches_rejected() {
        let mut table = TprPatchTable::new();
        table.insert(patch(0x1000, 6, TprPatchKind::Read)).unwrap();
        assert!(table.insert(patch(0x1004, 4, TprPatchKind::Read)).is_err());
        assert!(table.insert(patch(0x0ffe, 4, TprPatchKind::Read)).is_err());
        table.insert(patch(0x1006, 4, TprPatchKind::Read)).unwrap();
        table.insert(patch(0x0ffc, 4, TprPatchKind::Read)).unwrap();
        assert_eq!(
            table.covering(GuestVirtAddr::from_usize(0x1003)).unwrap().addr,
            GuestVirtAddr::from_usize(0x1000)
        );
        assert!(table.covering(GuestVirtAddr::from_usize(0x100a)).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut table = TprPatchTable::new();
        for i in 0..MAX_TPR_PATCHES {
            table.insert(patch(i * 0x10, 6, TprPatchKind::Read)).unwrap();
        }
        assert_eq!(
            table.insert(patch(0x10_0000, 6, TprPatchKind::Read)),
            ax_err!(NoMemory)
        );
    }

    #[test]
    fn page_invalidation() {
        let mut table = TprPatchTable::new();
        table.insert(patch(0x1ffe, 6, TprPatchKind::Read)).unwrap();
        table.insert(patch(0x2100, 6, TprPatchKind::ReadShr4)).unwrap();
        table.insert(patch(0x3000, 6, TprPatchKind::WriteReg)).unwrap();

        // The first patch straddles into page 0x2000.
        assert_eq!(table.invalidate_page(GuestVirtAddr::from_usize(0x2abc)), 2);
        assert_eq!(table.len(), 1);
        assert!(table.lookup(GuestVirtAddr::from_usize(0x3000)).is_some());
    }

    #[test]
    fn patch_at_the_top_of_the_address_space() {
        let mut table = TprPatchTable::new();
        let top = usize::MAX - 3;
        let last = patch(top, 6, TprPatchKind::WriteReg);
        assert_eq!(last.end(), usize::MAX);
        table.insert(last).unwrap();
        assert!(table.insert(patch(top - 2, 4, TprPatchKind::Read)).is_err());
        assert_eq!(
            table.covering(GuestVirtAddr::from_usize(usize::MAX - 1)).unwrap().addr,
            GuestVirtAddr::from_usize(top)
        );
        assert_eq!(table.record_fault(GuestVirtAddr::from_usize(top + 2)), Some(1));
        assert_eq!(table.invalidate_page(GuestVirtAddr::from_usize(top)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn faults_counted_and_clear() {
        let mut table = TprPatchTable::new();
        table
            .insert(patch(0x1000, 6, TprPatchKind::JumpReplacement))
            .unwrap();
        assert_eq!(table.record_fault(GuestVirtAddr::from_usize(0x1002)), Some(1));
        assert_eq!(table.record_fault(GuestVirtAddr::from_usize(0x1000)), Some(2));
        assert_eq!(table.record_fault(GuestVirtAddr::from_usize(0x2000)), None);
        assert!(table.remove(GuestVirtAddr::from_usize(0x1000)).is_some());
        table.insert(patch(0x1000, 6, TprPatchKind::Read)).unwrap();
        table.clear();
        assert!(table.is_empty());
    }
}
