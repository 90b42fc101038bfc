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

use axerrno::{AxResult, ax_err};

use crate::config::Platform;

bitflags::bitflags! {
    /// Guest register groups whose software copy may differ from the control structure.
    ///
    /// These bits mean the same thing on every platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextGroups: u32 {
        /// General-purpose registers (except `RSP`).
        const GPRS = 1 << 0;
        /// Instruction pointer.
        const RIP = 1 << 1;
        /// Stack pointer.
        const RSP = 1 << 2;
        /// Flags register.
        const RFLAGS = 1 << 3;
        /// `ES`, `CS`, `SS`, `DS`, `FS` and `GS`: selectors, bases, limits and access rights.
        const SEGMENTS = 1 << 4;
        /// `GDTR` and `IDTR`.
        const DESC_TABLES = 1 << 5;
        /// `LDTR` and `TR`.
        const SYS_SEGMENTS = 1 << 6;
        const CR0 = 1 << 7;
        /// No control-structure field: loaded by the entry primitive.
        const CR2 = 1 << 8;
        const CR3 = 1 << 9;
        const CR4 = 1 << 10;
        /// `DR7` lives in the control structure, the rest of the debug registers don't.
        const DR7 = 1 << 11;
        /// `DR0`-`DR3` and `DR6`.
        const DEBUG = 1 << 12;
        /// `XCR0` and `IA32_XSS`, which select the extended state the entry primitive switches.
        const FPU = 1 << 13;
        /// `SYSENTER` MSRs and `PAT`.
        const MSRS = 1 << 14;
        const EFER = 1 << 15;
        /// Interrupt shadow and NMI blocking.
        const INTERRUPTIBILITY = 1 << 16;
        /// Nested-virtualization state of the guest hypervisor: the VMCS link pointer.
        const HWVIRT = 1 << 17;
    }
}

impl ContextGroups {
    /// The groups the guest-state importer may have touched before failing.
    ///
    /// On an import failure these must be considered dirty again, whatever the importer
    /// managed to write before it bailed out.
    pub const IMPORT_FAULT_SUBSET: Self = Self::GPRS
        .union(Self::RIP)
        .union(Self::RSP)
        .union(Self::RFLAGS)
        .union(Self::SEGMENTS)
        .union(Self::CR0)
        .union(Self::CR3)
        .union(Self::CR4)
        .union(Self::DR7);

    /// Control registers.
    pub const CONTROL_REGS: Self = Self::CR0.union(Self::CR2).union(Self::CR3).union(Self::CR4);
}

bitflags::bitflags! {
    /// VT-x specific dirty state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmxDirty: u32 {
        /// Exception bitmap.
        const XCPT_INTERCEPTS = 1 << 0;
        const TSC_OFFSET = 1 << 1;
        /// VMX-preemption timer: pin control and timer value.
        const PREEMPT_TIMER = 1 << 2;
        /// Secondary, EPT and VPID enables of the processor-based execution controls.
        const PROC_CONTROLS = 1 << 3;
    }
}

bitflags::bitflags! {
    /// AMD-V specific dirty state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SvmDirty: u32 {
        /// Intercept vectors in the VMCB control area.
        const INTERCEPTS = 1 << 0;
        const TSC_OFFSET = 1 << 1;
    }
}

/// Platform-specific portion of the dirty state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtDirty {
    Vmx(VmxDirty),
    Svm(SvmDirty),
}

impl ExtDirty {
    /// An empty extension mask of the given flavour.
    pub const fn empty(platform: Platform) -> Self {
        match platform {
            Platform::Vmx => Self::Vmx(VmxDirty::empty()),
            Platform::Svm => Self::Svm(SvmDirty::empty()),
        }
    }

    /// A full extension mask of the given flavour.
    pub const fn all(platform: Platform) -> Self {
        match platform {
            Platform::Vmx => Self::Vmx(VmxDirty::all()),
            Platform::Svm => Self::Svm(SvmDirty::all()),
        }
    }

    /// The flavour of this mask.
    pub const fn platform(&self) -> Platform {
        match self {
            Self::Vmx(_) => Platform::Vmx,
            Self::Svm(_) => Platform::Svm,
        }
    }

    /// Whether no extension bit is set.
    pub const fn is_empty(&self) -> bool {
        match self {
            Self::Vmx(bits) => bits.is_empty(),
            Self::Svm(bits) => bits.is_empty(),
        }
    }
}

/// A snapshot of dirty state: generic groups plus the platform extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirtyMask {
    pub generic: ContextGroups,
    pub ext: ExtDirty,
}

impl DirtyMask {
    /// Whether nothing needs exporting.
    pub const fn is_empty(&self) -> bool {
        self.generic.is_empty() && self.ext.is_empty()
    }
}

/// Per-vcpu tracker of guest state that must be written to hardware before the next entry.
///
/// Bits are only ever cleared by [`DirtyTracker::clear_after_export`], and only the ones the
/// caller actually exported, so a partially failed export can be retried.
#[derive(Debug, Clone)]
pub struct DirtyTracker {
    generic: ContextGroups,
    ext: ExtDirty,
}

impl DirtyTracker {
    /// Create a tracker with everything dirty, as required before the very first entry.
    pub const fn new(platform: Platform) -> Self {
        Self {
            generic: ContextGroups::all(),
            ext: ExtDirty::all(platform),
        }
    }

    /// The platform flavour of the extension mask.
    pub const fn platform(&self) -> Platform {
        self.ext.platform()
    }

    /// Mark `groups` as changed in the software copy.
    pub fn mark_dirty(&mut self, groups: ContextGroups) {
        self.generic |= groups;
    }

    /// Mark platform-specific state as changed.
    pub fn mark_ext_dirty(&mut self, ext: ExtDirty) -> AxResult {
        match (&mut self.ext, ext) {
            (ExtDirty::Vmx(mine), ExtDirty::Vmx(bits)) => *mine |= bits,
            (ExtDirty::Svm(mine), ExtDirty::Svm(bits)) => *mine |= bits,
            (mine, other) => {
                return ax_err!(
                    InvalidInput,
                    format!(
                        "extension flavour {:?} does not match tracker flavour {:?}",
                        other.platform(),
                        mine.platform()
                    )
                );
            }
        }
        Ok(())
    }

    /// Mark every group dirty. Used on reset.
    pub fn mark_all(&mut self) {
        self.generic = ContextGroups::all();
        self.ext = ExtDirty::all(self.ext.platform());
    }

    /// The state that still has to be written to hardware. Nothing is cleared.
    pub const fn export_pending(&self) -> DirtyMask {
        DirtyMask {
            generic: self.generic,
            ext: self.ext,
        }
    }

    /// Clear exactly the bits in `exported`.
    pub fn clear_after_export(&mut self, exported: &DirtyMask) -> AxResult {
        match (&mut self.ext, exported.ext) {
            (ExtDirty::Vmx(mine), ExtDirty::Vmx(bits)) => *mine &= !bits,
            (ExtDirty::Svm(mine), ExtDirty::Svm(bits)) => *mine &= !bits,
            _ => return ax_err!(InvalidInput, "exported mask has the wrong extension flavour"),
        }
        self.generic &= !exported.generic;
        Ok(())
    }

    /// Record that importing guest state from hardware failed part way.
    pub fn mark_import_failed(&mut self) {
        self.generic |= ContextGroups::IMPORT_FAULT_SUBSET;
    }

    /// Whether all of `groups` are dirty.
    pub const fn is_dirty(&self, groups: ContextGroups) -> bool {
        self.generic.contains(groups)
    }

    /// Whether nothing is dirty.
    pub const fn is_clean(&self) -> bool {
        self.generic.is_empty() && self.ext.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn clean_vmx() -> DirtyTracker {
        let mut tracker = DirtyTracker::new(Platform::Vmx);
        let all = tracker.export_pending();
        tracker.clear_after_export(&all).unwrap();
        tracker
    }

    #[test]
    fn new_tracker_is_fully_dirty() {
        let tracker = DirtyTracker::new(Platform::Svm);
        assert!(tracker.is_dirty(ContextGroups::all()));
        assert_eq!(tracker.export_pending().ext, ExtDirty::Svm(SvmDirty::all()));
    }

    #[test]
    fn export_pending_does_not_clear() {
        let mut tracker = clean_vmx();
        tracker.mark_dirty(ContextGroups::RIP | ContextGroups::CR3);
        let first = tracker.export_pending();
        let second = tracker.export_pending();
        assert_eq!(first, second);
        assert_eq!(first.generic, ContextGroups::RIP | ContextGroups::CR3);
    }

    #[test]
    fn clear_only_removes_exported_groups() {
        let mut tracker = clean_vmx();
        tracker.mark_dirty(ContextGroups::RIP | ContextGroups::FPU | ContextGroups::DR7);
        let partial = DirtyMask {
            generic: ContextGroups::RIP,
            ext: ExtDirty::empty(Platform::Vmx),
        };
        tracker.clear_after_export(&partial).unwrap();
        assert_eq!(
            tracker.export_pending().generic,
            ContextGroups::FPU | ContextGroups::DR7
        );
    }

    #[test]
    fn import_failure_restores_the_fixed_subset() {
        let mut tracker = clean_vmx();
        tracker.mark_import_failed();
        assert_eq!(
            tracker.export_pending().generic,
            ContextGroups::IMPORT_FAULT_SUBSET
        );
        assert!(!tracker.is_dirty(ContextGroups::FPU));
    }

    #[test]
    fn extension_flavours_do_not_mix() {
        let mut tracker = clean_vmx();
        assert!(tracker
            .mark_ext_dirty(ExtDirty::Svm(SvmDirty::INTERCEPTS))
            .is_err());
        tracker
            .mark_ext_dirty(ExtDirty::Vmx(VmxDirty::TSC_OFFSET))
            .unwrap();
        assert!(!tracker.is_clean());
        let wrong = DirtyMask {
            generic: ContextGroups::empty(),
            ext: ExtDirty::Svm(SvmDirty::all()),
        };
        assert!(tracker.clear_after_export(&wrong).is_err());
        assert_eq!(
            tracker.export_pending().ext,
            ExtDirty::Vmx(VmxDirty::TSC_OFFSET)
        );
    }

    #[test]
    fn random_sequences_never_lose_unexported_groups() {
        let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);
        let mut tracker = clean_vmx();
        let mut model = ContextGroups::empty();
        for _ in 0..2000 {
            let bits = ContextGroups::from_bits_truncate(rng.gen());
            match rng.gen_range(0..3) {
                0 => {
                    tracker.mark_dirty(bits);
                    model |= bits;
                }
                1 => {
                    // Pretend only a random part of the pending set was exported.
                    let exported = tracker.export_pending().generic & bits;
                    tracker
                        .clear_after_export(&DirtyMask {
                            generic: exported,
                            ext: ExtDirty::empty(Platform::Vmx),
                        })
                        .unwrap();
                    model &= !exported;
                }
                _ => {
                    tracker.mark_import_failed();
                    model |= ContextGroups::IMPORT_FAULT_SUBSET;
                }
            }
            assert_eq!(tracker.export_pending().generic, model);
        }
    }
}
