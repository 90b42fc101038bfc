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

use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::exit::ClassifiedExit;
use crate::regs::GuestContext;
use crate::tpr::TprPatchTable;

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
pub trait AxHmHal {
    /// The index of the physical CPU the calling thread runs on.
    ///
    /// Only stable while preemption is disabled.
    fn current_cpu_id() -> usize;

    /// Disable preemption (and interrupts) on the current CPU.
    ///
    /// Returns an opaque token holding the previous state, handed back to
    /// [`AxHmHal::preempt_restore`].
    fn preempt_disable() -> usize;

    /// Restore the preemption state saved by [`AxHmHal::preempt_disable`].
    fn preempt_restore(saved: usize);

    /// A monotonic timestamp, used to age exit records.
    fn timestamp() -> u64 {
        0
    }
}

/// The memory-management collaborator owning the nested page tables.
pub trait NestedPagingProvider {
    /// Root of the extended page tables the guest runs with.
    fn root_pointer(&self) -> HostPhysAddr;

    /// Hardware reported a malformed translation for `gpa`: the page-table entries behind it
    /// must be rebuilt before the guest touches it again.
    fn page_tables_stale(&mut self, gpa: GuestPhysAddr);
}

/// The disassembly/interpreter collaborator.
pub trait InstructionEmulator {
    /// Emulate the instruction behind `exit`.
    ///
    /// Returns `Ok(true)` if the instruction was completed and the guest can continue, with
    /// `context` updated accordingly, `Ok(false)` if the instruction is not supported. The TPR
    /// patch table of the vcpu is handed over so patches can be looked up and installed.
    fn emulate(
        &mut self,
        exit: &ClassifiedExit,
        context: &mut GuestContext,
        patches: &mut TprPatchTable,
    ) -> AxResult<bool>;
}
