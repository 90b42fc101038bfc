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

use axerrno::AxResult;

use crate::mitigation::MitigationStep;
use crate::regs::{GeneralRegisters, SoftwareState};
use crate::tlb::TlbScope;
use crate::vmcs::{FieldId, StructureKind};

/// Hardware virtualization primitives of one vcpu.
///
/// This trait is the binary-compatibility boundary of the crate: implementations wrap the
/// virtualization-extension instructions (`VMLAUNCH`/`VMRESUME`/`VMREAD`/`VMWRITE`/`INVVPID`
/// or their AMD-V counterparts) and nothing else. All policy lives on the other side.
///
/// # Contract
///
/// - [`AxArchVCpu::enter_guest`] runs inside the non-preemptible section of the world switch.
///   It must not block, allocate or take locks.
/// - Field values are passed zero-extended to 64 bits whatever the field width.
pub trait AxArchVCpu {
    /// Enter the guest through the control structure `structure` and return the raw exit
    /// reason once the guest exits.
    ///
    /// `launch` selects a first entry (launch) over a resumed one. `regs` holds the guest
    /// general-purpose registers on entry and receives them on exit.
    ///
    /// An `Err` means the entry instruction itself failed (no guest code ran); the error
    /// number is in [`field::VM_INSTRUCTION_ERROR`](crate::vmcs::field::VM_INSTRUCTION_ERROR).
    fn enter_guest(
        &mut self,
        structure: StructureKind,
        launch: bool,
        regs: &mut GeneralRegisters,
    ) -> AxResult<u32>;

    /// Read a control-structure field.
    fn read_field(&self, structure: StructureKind, field: FieldId) -> AxResult<u64>;

    /// Write a control-structure field.
    fn write_field(&mut self, structure: StructureKind, field: FieldId, value: u64) -> AxResult;

    /// Hand over guest state that has no control-structure field.
    ///
    /// The implementation keeps `state` and loads it right before every following entry into
    /// `structure`, saving whatever the guest changed after the exit.
    fn load_software_state(&mut self, structure: StructureKind, state: SoftwareState) -> AxResult;

    /// Invalidate cached address translations.
    fn invalidate_translation(&mut self, scope: TlbScope) -> AxResult;

    /// Perform one side-channel mitigation step around the entry.
    ///
    /// Called inside the non-preemptible section.
    fn apply_mitigation(&mut self, step: MitigationStep);
}
