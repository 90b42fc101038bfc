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

use crate::arch_vcpu::AxArchVCpu;

/// Encoding of a control-structure field (SDM Vol. 3C, Appendix B).
///
/// These values are handed verbatim to the field access primitives and must match the
/// hardware layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u32);

/// Field encodings used by the execution core.
pub mod field {
    use x86::vmx::vmcs::{control, guest, ro};

    use super::FieldId;

    pub const VPID: FieldId = FieldId(control::VPID);

    pub const TSC_OFFSET: FieldId = FieldId(control::TSC_OFFSET_FULL);
    pub const EPT_POINTER: FieldId = FieldId(control::EPTP_FULL);
    pub const GUEST_PHYSICAL_ADDR: FieldId = FieldId(ro::GUEST_PHYSICAL_ADDR_FULL);
    pub const VMCS_LINK_POINTER: FieldId = FieldId(guest::LINK_PTR_FULL);
    pub const GUEST_IA32_PAT: FieldId = FieldId(guest::IA32_PAT_FULL);
    pub const GUEST_IA32_EFER: FieldId = FieldId(guest::IA32_EFER_FULL);

    pub const PIN_BASED_EXEC_CONTROLS: FieldId = FieldId(control::PINBASED_EXEC_CONTROLS);
    pub const PROC_BASED_EXEC_CONTROLS: FieldId = FieldId(control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    pub const EXCEPTION_BITMAP: FieldId = FieldId(control::EXCEPTION_BITMAP);
    pub const VMEXIT_CONTROLS: FieldId = FieldId(control::VMEXIT_CONTROLS);
    pub const VMENTRY_CONTROLS: FieldId = FieldId(control::VMENTRY_CONTROLS);
    pub const VMENTRY_INTERRUPTION_INFO: FieldId =
        FieldId(control::VMENTRY_INTERRUPTION_INFO_FIELD);
    pub const VMENTRY_EXCEPTION_ERRCODE: FieldId = FieldId(control::VMENTRY_EXCEPTION_ERR_CODE);
    pub const VMENTRY_INSTRUCTION_LEN: FieldId = FieldId(control::VMENTRY_INSTRUCTION_LEN);
    pub const SECONDARY_PROC_BASED_EXEC_CONTROLS: FieldId =
        FieldId(control::SECONDARY_PROCBASED_EXEC_CONTROLS);
    pub const PLE_GAP: FieldId = FieldId(control::PLE_GAP);
    pub const PLE_WINDOW: FieldId = FieldId(control::PLE_WINDOW);

    pub const VM_INSTRUCTION_ERROR: FieldId = FieldId(ro::VM_INSTRUCTION_ERROR);
    pub const EXIT_REASON: FieldId = FieldId(ro::EXIT_REASON);
    pub const EXIT_INTERRUPTION_INFO: FieldId = FieldId(ro::VMEXIT_INTERRUPTION_INFO);
    pub const EXIT_INTERRUPTION_ERRCODE: FieldId = FieldId(ro::VMEXIT_INTERRUPTION_ERR_CODE);
    pub const IDT_VECTORING_INFO: FieldId = FieldId(ro::IDT_VECTORING_INFO);
    pub const IDT_VECTORING_ERRCODE: FieldId = FieldId(ro::IDT_VECTORING_ERR_CODE);
    pub const EXIT_INSTRUCTION_LEN: FieldId = FieldId(ro::VMEXIT_INSTRUCTION_LEN);
    pub const GUEST_INTERRUPTIBILITY: FieldId = FieldId(guest::INTERRUPTIBILITY_STATE);
    pub const GUEST_SYSENTER_CS: FieldId = FieldId(guest::IA32_SYSENTER_CS);
    pub const VMX_PREEMPTION_TIMER_VALUE: FieldId = FieldId(guest::VMX_PREEMPTION_TIMER_VALUE);
    pub const GUEST_GDTR_LIMIT: FieldId = FieldId(guest::GDTR_LIMIT);
    pub const GUEST_IDTR_LIMIT: FieldId = FieldId(guest::IDTR_LIMIT);

    pub const CR0_GUEST_HOST_MASK: FieldId = FieldId(control::CR0_GUEST_HOST_MASK);
    pub const CR4_GUEST_HOST_MASK: FieldId = FieldId(control::CR4_GUEST_HOST_MASK);
    pub const EXIT_QUALIFICATION: FieldId = FieldId(ro::EXIT_QUALIFICATION);
    pub const GUEST_LINEAR_ADDR: FieldId = FieldId(ro::GUEST_LINEAR_ADDR);

    pub const GUEST_CR0: FieldId = FieldId(guest::CR0);
    pub const GUEST_CR3: FieldId = FieldId(guest::CR3);
    pub const GUEST_CR4: FieldId = FieldId(guest::CR4);
    pub const GUEST_GDTR_BASE: FieldId = FieldId(guest::GDTR_BASE);
    pub const GUEST_IDTR_BASE: FieldId = FieldId(guest::IDTR_BASE);
    pub const GUEST_DR7: FieldId = FieldId(guest::DR7);
    pub const GUEST_RSP: FieldId = FieldId(guest::RSP);
    pub const GUEST_RIP: FieldId = FieldId(guest::RIP);
    pub const GUEST_RFLAGS: FieldId = FieldId(guest::RFLAGS);
    pub const GUEST_SYSENTER_ESP: FieldId = FieldId(guest::IA32_SYSENTER_ESP);
    pub const GUEST_SYSENTER_EIP: FieldId = FieldId(guest::IA32_SYSENTER_EIP);

    /// Selector, base, limit and access rights of each segment register, `ES` = 0 ... `TR` = 7.
    const SEGMENTS: [[u32; 4]; 8] = [
        [guest::ES_SELECTOR, guest::ES_BASE, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS],
        [guest::CS_SELECTOR, guest::CS_BASE, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS],
        [guest::SS_SELECTOR, guest::SS_BASE, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS],
        [guest::DS_SELECTOR, guest::DS_BASE, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS],
        [guest::FS_SELECTOR, guest::FS_BASE, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS],
        [guest::GS_SELECTOR, guest::GS_BASE, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS],
        [
            guest::LDTR_SELECTOR,
            guest::LDTR_BASE,
            guest::LDTR_LIMIT,
            guest::LDTR_ACCESS_RIGHTS,
        ],
        [guest::TR_SELECTOR, guest::TR_BASE, guest::TR_LIMIT, guest::TR_ACCESS_RIGHTS],
    ];

    /// Selector field of segment register `index`.
    pub const fn guest_selector(index: usize) -> FieldId {
        FieldId(SEGMENTS[index][0])
    }

    pub const fn guest_segment_base(index: usize) -> FieldId {
        FieldId(SEGMENTS[index][1])
    }

    pub const fn guest_segment_limit(index: usize) -> FieldId {
        FieldId(SEGMENTS[index][2])
    }

    pub const fn guest_segment_access_rights(index: usize) -> FieldId {
        FieldId(SEGMENTS[index][3])
    }
}

/// Execution-control bits the core itself depends on.
pub mod controls {
    use x86::vmx::vmcs::control::{PinbasedControls, PrimaryControls, SecondaryControls};

    /// Pin-based: VMX-preemption timer.
    pub const PIN_PREEMPTION_TIMER: u64 = PinbasedControls::VMX_PREEMPTION_TIMER.bits() as u64;
    /// Primary processor-based: interrupt-window exiting.
    pub const PROC_INTERRUPT_WINDOW_EXITING: u64 =
        PrimaryControls::INTERRUPT_WINDOW_EXITING.bits() as u64;
    /// Primary processor-based: activate secondary controls.
    pub const PROC_SECONDARY_CONTROLS: u64 = PrimaryControls::SECONDARY_CONTROLS.bits() as u64;
    /// Secondary processor-based: enable EPT.
    pub const PROC2_ENABLE_EPT: u64 = SecondaryControls::ENABLE_EPT.bits() as u64;
    /// Secondary processor-based: enable VPID.
    pub const PROC2_ENABLE_VPID: u64 = SecondaryControls::ENABLE_VPID.bits() as u64;
    /// Secondary processor-based: PAUSE-loop exiting.
    pub const PROC2_PAUSE_LOOP_EXITING: u64 = SecondaryControls::PAUSE_LOOP_EXITING.bits() as u64;
}

/// Which of the two control structures of a vcpu a primitive operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    /// The structure the host uses to run the (outer) guest.
    Outer,
    /// The structure the host uses to run the guest's own guest.
    Nested,
}

/// Launch state of a control structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Cleared: the next entry must be a launch.
    Clear,
    /// Launched: the next entry is a resume.
    Launched,
}

/// How address-space tags are invalidated on this vcpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFlushMode {
    /// No tags: every entry and exit flushes implicitly.
    NotSupported,
    /// Tags are flushed one context at a time.
    SingleContext,
}

/// Control fields that are expensive to read back and therefore cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedControl {
    PinControls = 0,
    ProcControls = 1,
    ProcControls2 = 2,
    EntryControls = 3,
    ExitControls = 4,
    ExceptionBitmap = 5,
    TscOffset = 6,
    Vpid = 7,
}

impl CachedControl {
    /// All cached controls.
    pub const ALL: [Self; 8] = [
        Self::PinControls,
        Self::ProcControls,
        Self::ProcControls2,
        Self::EntryControls,
        Self::ExitControls,
        Self::ExceptionBitmap,
        Self::TscOffset,
        Self::Vpid,
    ];

    /// The hardware field backing this control.
    pub const fn field(self) -> FieldId {
        match self {
            Self::PinControls => field::PIN_BASED_EXEC_CONTROLS,
            Self::ProcControls => field::PROC_BASED_EXEC_CONTROLS,
            Self::ProcControls2 => field::SECONDARY_PROC_BASED_EXEC_CONTROLS,
            Self::EntryControls => field::VMENTRY_CONTROLS,
            Self::ExitControls => field::VMEXIT_CONTROLS,
            Self::ExceptionBitmap => field::EXCEPTION_BITMAP,
            Self::TscOffset => field::TSC_OFFSET,
            Self::Vpid => field::VPID,
        }
    }
}

/// A copy of the cached controls, taken for fatal-error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub kind: StructureKind,
    pub launch_state: LaunchState,
    pub tag_mode: TagFlushMode,
    /// Indexed by [`CachedControl`]; `None` for controls never written.
    pub values: [Option<u64>; 8],
}

/// Write-through cache of one control structure.
///
/// A cached value is only updated after the hardware write succeeded, so the cache never
/// claims a value the hardware does not hold.
#[derive(Debug, Clone)]
pub struct ControlStructureInfo {
    kind: StructureKind,
    launch_state: LaunchState,
    tag_mode: TagFlushMode,
    values: [Option<u64>; 8],
}

impl ControlStructureInfo {
    /// A fresh, cleared structure with nothing cached.
    pub const fn new(kind: StructureKind, tag_mode: TagFlushMode) -> Self {
        Self {
            kind,
            launch_state: LaunchState::Clear,
            tag_mode,
            values: [None; 8],
        }
    }

    /// Which structure this is.
    pub const fn kind(&self) -> StructureKind {
        self.kind
    }

    /// Current launch state.
    pub const fn launch_state(&self) -> LaunchState {
        self.launch_state
    }

    /// The tag management mode.
    pub const fn tag_mode(&self) -> TagFlushMode {
        self.tag_mode
    }

    /// Record a successful launch.
    pub fn mark_launched(&mut self) {
        self.launch_state = LaunchState::Launched;
    }

    /// The structure was cleared (e.g. unbound from its CPU).
    pub fn mark_cleared(&mut self) {
        self.launch_state = LaunchState::Clear;
    }

    /// The last value written to `control`, if any.
    pub fn cached(&self, control: CachedControl) -> Option<u64> {
        self.values[control as usize]
    }

    /// Write `value` to `control` unless hardware already holds it.
    pub fn write<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        control: CachedControl,
        value: u64,
    ) -> AxResult {
        if self.values[control as usize] == Some(value) {
            return Ok(());
        }
        arch.write_field(self.kind, control.field(), value)?;
        self.values[control as usize] = Some(value);
        Ok(())
    }

    /// Set or clear `bits` in `control`.
    pub fn update_bits<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        control: CachedControl,
        bits: u64,
        set: bool,
    ) -> AxResult {
        let current = match self.values[control as usize] {
            Some(value) => value,
            None => arch.read_field(self.kind, control.field())?,
        };
        let value = if set { current | bits } else { current & !bits };
        self.write(arch, control, value)
    }

    /// Compare every cached control against hardware.
    ///
    /// A mismatch means either the hardware contract was violated or somebody wrote the field
    /// behind the cache's back; both are fatal.
    pub fn verify<A: AxArchVCpu>(&self, arch: &A) -> AxResult {
        for control in CachedControl::ALL {
            if let Some(expected) = self.values[control as usize] {
                let actual = arch.read_field(self.kind, control.field())?;
                if actual != expected {
                    error!(
                        "{:?} {:?} reads back {:#x}, cached {:#x}",
                        self.kind, control, actual, expected
                    );
                    return ax_err!(InvalidData, "control field readback mismatch");
                }
            }
        }
        Ok(())
    }

    /// Forget every cached value, e.g. after the structure was reloaded from memory.
    pub fn invalidate_cache(&mut self) {
        self.values = [None; 8];
    }

    /// Copy of the cached state.
    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            kind: self.kind,
            launch_state: self.launch_state,
            tag_mode: self.tag_mode,
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_match_the_architectural_layout() {
        assert_eq!(field::VPID, FieldId(0x0000));
        assert_eq!(field::EPT_POINTER, FieldId(0x201a));
        assert_eq!(field::VMCS_LINK_POINTER, FieldId(0x2800));
        assert_eq!(field::VMENTRY_INTERRUPTION_INFO, FieldId(0x4016));
        assert_eq!(field::IDT_VECTORING_INFO, FieldId(0x4408));
        assert_eq!(field::VMX_PREEMPTION_TIMER_VALUE, FieldId(0x482e));
        assert_eq!(field::GUEST_RIP, FieldId(0x681e));

        // ES and TR bound the segment table.
        assert_eq!(field::guest_selector(0), FieldId(0x0800));
        assert_eq!(field::guest_selector(7), FieldId(0x080e));
        assert_eq!(field::guest_segment_limit(7), FieldId(0x480e));
        assert_eq!(field::guest_segment_access_rights(0), FieldId(0x4814));
        assert_eq!(field::guest_segment_base(7), FieldId(0x6814));
    }

    #[test]
    fn control_bits() {
        assert_eq!(controls::PIN_PREEMPTION_TIMER, 1 << 6);
        assert_eq!(controls::PROC_INTERRUPT_WINDOW_EXITING, 1 << 2);
        assert_eq!(controls::PROC_SECONDARY_CONTROLS, 1 << 31);
        assert_eq!(controls::PROC2_ENABLE_EPT, 1 << 1);
        assert_eq!(controls::PROC2_ENABLE_VPID, 1 << 5);
    }
}
