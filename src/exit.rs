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

use crate::addr::GuestPhysAddr;
use crate::event::PendingEvent;
use crate::vmcs::StructureKind;

#[allow(unused_imports)] // used in doc
use crate::AxVCpu;

/// Basic exit reasons (SDM Vol. 3D, Appendix C).
pub mod reason {
    pub const EXCEPTION_NMI: u32 = 0;
    pub const EXTERNAL_INTERRUPT: u32 = 1;
    pub const TRIPLE_FAULT: u32 = 2;
    pub const INIT: u32 = 3;
    pub const SIPI: u32 = 4;
    pub const INTERRUPT_WINDOW: u32 = 7;
    pub const NMI_WINDOW: u32 = 8;
    pub const TASK_SWITCH: u32 = 9;
    pub const CPUID: u32 = 10;
    pub const HLT: u32 = 12;
    pub const INVLPG: u32 = 14;
    pub const RDTSC: u32 = 16;
    pub const VMCALL: u32 = 18;
    pub const VMCLEAR: u32 = 19;
    pub const VMLAUNCH: u32 = 20;
    pub const VMPTRLD: u32 = 21;
    pub const VMPTRST: u32 = 22;
    pub const VMREAD: u32 = 23;
    pub const VMRESUME: u32 = 24;
    pub const VMWRITE: u32 = 25;
    pub const VMXOFF: u32 = 26;
    pub const VMXON: u32 = 27;
    pub const CR_ACCESS: u32 = 28;
    pub const DR_ACCESS: u32 = 29;
    pub const IO_INSTRUCTION: u32 = 30;
    pub const MSR_READ: u32 = 31;
    pub const MSR_WRITE: u32 = 32;
    pub const INVALID_GUEST_STATE: u32 = 33;
    pub const PAUSE: u32 = 40;
    pub const APIC_ACCESS: u32 = 44;
    pub const EPT_VIOLATION: u32 = 48;
    pub const EPT_MISCONFIG: u32 = 49;
    pub const INVEPT: u32 = 50;
    pub const PREEMPTION_TIMER: u32 = 52;
    pub const INVVPID: u32 = 53;
    pub const XSETBV: u32 = 55;

    /// Set in the raw exit reason when the entry itself failed.
    pub const ENTRY_FAILURE: u32 = 1 << 31;
}

/// Extract the basic exit reason from the raw exit-reason field.
pub const fn basic_reason(raw: u32) -> u32 {
    raw & 0xffff
}

/// Structured outcome of one exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// The guest executed an instruction that asks the host for a service (`HLT`, `CPUID`,
    /// `VMCALL`, port I/O, MSR access, control-register access, ...).
    GuestRequestedExit,
    /// A guest exception or NMI, a triple fault, or a fault on a guest-physical access.
    Fault,
    /// A host interrupt arrived while the guest ran.
    ExternalInterrupt,
    /// An exit concerning nested virtualization: either the guest hypervisor executed a VMX
    /// instruction, or the guest's own guest exited to its hypervisor.
    NestedVmExit,
    /// The preemption timer armed by the host expired.
    PreemptionTimerExpired,
    /// The guest attempted a hardware task switch.
    TaskSwitch,
    /// Anything the core does not know how to handle.
    Unsupported,
    /// The interrupt (or NMI) window the host asked for opened.
    ///
    /// Handled inside [`AxVCpu::run_slice`]; only returned when the slice has to end anyway.
    InterruptWindow,
}

/// Whether an exit taken while the nested guest ran belongs to the host rather than to the
/// guest hypervisor.
const fn host_owned(basic: u32) -> bool {
    matches!(
        basic,
        reason::EXTERNAL_INTERRUPT
            | reason::TRIPLE_FAULT
            | reason::INTERRUPT_WINDOW
            | reason::NMI_WINDOW
            | reason::EPT_VIOLATION
            | reason::EPT_MISCONFIG
            | reason::PREEMPTION_TIMER
    )
}

/// Map a raw exit reason to an [`ExitClass`].
///
/// `mode` is the structure the guest ran on. Entry failures (bit 31) must be filtered out by
/// the caller.
pub fn classify(raw: u32, mode: StructureKind) -> ExitClass {
    use reason::*;
    let basic = basic_reason(raw);
    if mode == StructureKind::Nested && !host_owned(basic) {
        return ExitClass::NestedVmExit;
    }
    match basic {
        EXCEPTION_NMI | TRIPLE_FAULT | EPT_VIOLATION | EPT_MISCONFIG => ExitClass::Fault,
        EXTERNAL_INTERRUPT => ExitClass::ExternalInterrupt,
        INTERRUPT_WINDOW | NMI_WINDOW => ExitClass::InterruptWindow,
        TASK_SWITCH => ExitClass::TaskSwitch,
        CPUID | HLT | INVLPG | RDTSC | VMCALL | CR_ACCESS | DR_ACCESS | IO_INSTRUCTION
        | MSR_READ | MSR_WRITE | PAUSE | APIC_ACCESS | XSETBV => ExitClass::GuestRequestedExit,
        VMCLEAR..=VMXON | INVEPT | INVVPID => ExitClass::NestedVmExit,
        PREEMPTION_TIMER => ExitClass::PreemptionTimerExpired,
        _ => ExitClass::Unsupported,
    }
}

/// The result of [`AxVCpu::run_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedExit {
    pub class: ExitClass,
    /// Basic exit reason.
    pub reason: u32,
    /// Structure the guest ran on.
    pub mode: StructureKind,
    /// Guest instruction pointer at the exit.
    pub rip: u64,
    /// Exit qualification.
    pub qualification: u64,
    /// Length of the exiting instruction, for exits caused by one.
    pub instr_len: u32,
    /// The guest exception, for [`reason::EXCEPTION_NMI`] exits.
    pub exception: Option<PendingEvent>,
    /// Faulting guest-physical address, for EPT exits.
    pub guest_phys_addr: Option<GuestPhysAddr>,
    /// An event the nested guest was receiving when it exited to the guest hypervisor.
    ///
    /// Not re-injected: the guest hypervisor decides what to do with it.
    pub interrupted: Option<PendingEvent>,
    /// The instruction emulator already handled the exit.
    pub emulated: bool,
}

impl ClassifiedExit {
    pub(crate) const fn new(class: ExitClass, reason: u32, mode: StructureKind) -> Self {
        Self {
            class,
            reason,
            mode,
            rip: 0,
            qualification: 0,
            instr_len: 0,
            exception: None,
            guest_phys_addr: None,
            interrupted: None,
            emulated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_guest_classification() {
        let outer = StructureKind::Outer;
        assert_eq!(
            classify(reason::EXTERNAL_INTERRUPT, outer),
            ExitClass::ExternalInterrupt
        );
        assert_eq!(classify(reason::HLT, outer), ExitClass::GuestRequestedExit);
        assert_eq!(classify(reason::IO_INSTRUCTION, outer), ExitClass::GuestRequestedExit);
        assert_eq!(classify(reason::EXCEPTION_NMI, outer), ExitClass::Fault);
        assert_eq!(classify(reason::EPT_MISCONFIG, outer), ExitClass::Fault);
        assert_eq!(classify(reason::VMLAUNCH, outer), ExitClass::NestedVmExit);
        assert_eq!(classify(reason::TASK_SWITCH, outer), ExitClass::TaskSwitch);
        assert_eq!(
            classify(reason::PREEMPTION_TIMER, outer),
            ExitClass::PreemptionTimerExpired
        );
        assert_eq!(classify(reason::INTERRUPT_WINDOW, outer), ExitClass::InterruptWindow);
        assert_eq!(classify(reason::INVALID_GUEST_STATE, outer), ExitClass::Unsupported);
        assert_eq!(classify(reason::INIT, outer), ExitClass::Unsupported);
    }

    #[test]
    fn nested_guest_exits_go_to_guest_hypervisor() {
        let nested = StructureKind::Nested;
        assert_eq!(classify(reason::CPUID, nested), ExitClass::NestedVmExit);
        assert_eq!(classify(reason::EXCEPTION_NMI, nested), ExitClass::NestedVmExit);
        assert_eq!(
            classify(reason::EXTERNAL_INTERRUPT, nested),
            ExitClass::ExternalInterrupt
        );
        assert_eq!(classify(reason::EPT_VIOLATION, nested), ExitClass::Fault);
    }

    #[test]
    fn basic_reason_strips_flags() {
        assert_eq!(basic_reason(reason::ENTRY_FAILURE | reason::INVALID_GUEST_STATE), 33);
        assert_eq!(basic_reason(1 << 27 | reason::VMCALL), reason::VMCALL);
    }
}
