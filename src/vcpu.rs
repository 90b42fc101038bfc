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

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::RefCell;

use axerrno::{AxResult, ax_err};

use crate::addr::GuestVirtAddr;
use crate::arch_vcpu::AxArchVCpu;
use crate::config::{HmConfig, Platform};
use crate::diag::{ExitStats, FatalDump};
use crate::dirty::{ContextGroups, ExtDirty, SvmDirty, VmxDirty};
use crate::event::{PendingEvent, SetPendingOutcome};
use crate::exit::ClassifiedExit;
use crate::hal::{AxHmHal, InstructionEmulator, NestedPagingProvider};
use crate::history::ExitHistory;
use crate::nested::{NestedFields, NestedOverrides};
use crate::percpu::{FIRST_GUEST_TAG, PhysCpuRegistry};
use crate::regs::GuestContext;
use crate::switch::{PokeHandle, VirtualCpuHmState, WorldSwitch};
use crate::tpr::TprPatchTable;
use crate::vmcs::{ControlSnapshot, StructureKind};

/// The constant part of `AxVCpu`.
struct AxVCpuInnerConst {
    /// The id of the vcpu.
    id: usize,
    /// The id of the physical CPU who has the priority to run this vcpu.
    favor_phys_cpu: usize,
    /// The set of physical CPUs who can run this vcpu.
    /// If `None`, the vcpu can run on any physical CPU.
    /// Refer to [CPU_SET](https://man7.org/linux/man-pages/man3/CPU_SET.3.html) in Linux.
    phys_cpu_set: Option<usize>,
}

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state.
    Invalid = 0,
    /// The vcpu is created but not initialized yet.
    Created = 1,
    /// The vcpu is already initialized and can be bound to a physical CPU.
    Free = 2,
    /// The vcpu is bound to a physical CPU and ready to run.
    Ready = 3,
    /// The vcpu is bound to a physical CPU and running.
    Running = 4,
}

/// The mutable part of [`AxVCpu`].
pub struct AxVCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
}

/// A hardware-assisted virtual CPU.
///
/// The hardware primitives are delegated to a struct implementing [`AxArchVCpu`] and host
/// services to [`AxHmHal`]; this struct owns everything in between: dirty tracking, tags,
/// event injection, nested control caching and the world switch itself.
///
/// Note that:
/// - This struct handles internal mutability itself, almost all the methods are `&self`.
/// - This struct is not thread-safe. It's caller's responsibility to ensure the safety. The
///   only handle meant for other threads is the [`PokeHandle`].
pub struct AxVCpu<A: AxArchVCpu, H: AxHmHal> {
    /// The constant part of the vcpu.
    inner_const: AxVCpuInnerConst,
    /// The mutable part of the vcpu.
    inner_mut: RefCell<AxVCpuInnerMut>,
    /// The architecture-specific state of the vcpu.
    arch_vcpu: RefCell<A>,
    /// Hardware-assist state and the world-switch coordinator.
    hm: RefCell<WorldSwitch<H>>,
    paging: RefCell<Box<dyn NestedPagingProvider>>,
    emulator: RefCell<Option<Box<dyn InstructionEmulator>>>,
}

impl<A: AxArchVCpu, H: AxHmHal> AxVCpu<A, H> {
    /// Create a new [`AxVCpu`].
    ///
    /// `registry` is the process-wide physical CPU registry shared by all vcpus.
    pub fn new(
        id: usize,
        favor_phys_cpu: usize,
        phys_cpu_set: Option<usize>,
        arch_vcpu: A,
        config: HmConfig,
        registry: Arc<PhysCpuRegistry>,
        paging: Box<dyn NestedPagingProvider>,
    ) -> AxResult<Self> {
        if config.tags_supported && config.max_tag < FIRST_GUEST_TAG {
            return ax_err!(InvalidInput, "no address-space tag left for guests");
        }
        Ok(Self {
            inner_const: AxVCpuInnerConst {
                id,
                favor_phys_cpu,
                phys_cpu_set,
            },
            inner_mut: RefCell::new(AxVCpuInnerMut {
                state: VCpuState::Created,
            }),
            arch_vcpu: RefCell::new(arch_vcpu),
            hm: RefCell::new(WorldSwitch::new(config, registry)),
            paging: RefCell::new(paging),
            emulator: RefCell::new(None),
        })
    }

    /// Setup the vcpu to start at `entry`.
    pub fn setup(&self, entry: GuestVirtAddr, exception_bitmap: u64) -> AxResult {
        self.with_state_transition(VCpuState::Created, VCpuState::Free, || {
            let mut hm = self.hm.borrow_mut();
            hm.context.rip = entry.as_usize() as u64;
            hm.exception_bitmap = exception_bitmap;
            hm.hm.dirty.mark_all();
            Ok(())
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.inner_const.id
    }

    /// Get the id of the physical CPU who has the priority to run this vcpu.
    /// Currently unused.
    pub const fn favor_phys_cpu(&self) -> usize {
        self.inner_const.favor_phys_cpu
    }

    /// Get the set of physical CPUs who can run this vcpu.
    /// If `None`, this vcpu has no limitation and can be scheduled on any physical CPU.
    pub const fn phys_cpu_set(&self) -> Option<usize> {
        self.inner_const.phys_cpu_set
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.inner_const.id == 0
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.borrow().state
    }

    /// Set the state of the vcpu.
    /// # Safety
    /// This method is unsafe because it may break the state transition model.
    /// Use it with caution.
    pub unsafe fn set_state(&self, state: VCpuState) {
        self.inner_mut.borrow_mut().state = state;
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state will be set to [`VCpuState::Invalid`] if an error occurs (including the case that the current state is not `from`).
    ///
    /// The state will be set to `to` if the block is executed successfully.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.borrow_mut();
        if inner_mut.state != from {
            let actual = inner_mut.state;
            inner_mut.state = VCpuState::Invalid;
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, actual)
            )
        } else {
            let result = f();
            inner_mut.state = if result.is_err() {
                VCpuState::Invalid
            } else {
                to
            };
            result
        }
    }

    /// Execute an operation on the architecture-specific vcpu, with the state transitioned from `from` to `to`.
    pub fn manipulate_arch_vcpu<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut A) -> AxResult<T>,
    {
        self.with_state_transition(from, to, || f(&mut *self.arch_vcpu.borrow_mut()))
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Execute a block with the architecture-specific vcpu.
    pub fn with_arch_vcpu<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut A) -> T,
    {
        f(&mut *self.arch_vcpu.borrow_mut())
    }

    /// Install the instruction emulator consulted for exits the core cannot handle.
    pub fn set_emulator(&self, emulator: Box<dyn InstructionEmulator>) {
        self.emulator.borrow_mut().replace(emulator);
    }

    /// Run the vcpu for one slice on the current physical CPU.
    ///
    /// Returns the exit that ended the slice. Errors other than fatal ones leave the vcpu
    /// [`VCpuState::Ready`]; after a fatal error the vcpu is [`VCpuState::Invalid`] and
    /// [`AxVCpu::fatal_dump`] tells what happened.
    pub fn run_slice(&self) -> AxResult<ClassifiedExit> {
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;
        let result = {
            let mut hm = self.hm.borrow_mut();
            let mut arch = self.arch_vcpu.borrow_mut();
            let mut paging = self.paging.borrow_mut();
            let mut emulator = self.emulator.borrow_mut();
            hm.run_slice(
                &mut *arch,
                &mut **paging,
                emulator
                    .as_mut()
                    .map(|emulator| &mut **emulator as &mut dyn InstructionEmulator),
            )
        };
        let fatal = self.hm.borrow().fatal.is_some();
        self.inner_mut.borrow_mut().state = if fatal {
            VCpuState::Invalid
        } else {
            VCpuState::Ready
        };
        result
    }

    /// Bind the vcpu to the current physical CPU.
    pub fn bind(&self) -> AxResult {
        self.transition_state(VCpuState::Free, VCpuState::Ready)
    }

    /// Unbind the vcpu from the current physical CPU.
    ///
    /// The control structures must be launched again on whatever CPU runs the vcpu next.
    pub fn unbind(&self) -> AxResult {
        self.with_state_transition(VCpuState::Ready, VCpuState::Free, || {
            let mut hm = self.hm.borrow_mut();
            hm.outer.mark_cleared();
            hm.nested_ctl.mark_cleared();
            Ok(())
        })
    }

    /// Full virtual machine reset of this vcpu.
    ///
    /// Drops the TLB generation, pending events, nested state, exit history and TPR patches.
    pub fn reset(&self) -> AxResult {
        match self.state() {
            VCpuState::Free | VCpuState::Ready => {
                self.hm.borrow_mut().reset();
                Ok(())
            }
            state => ax_err!(BadState, format!("cannot reset a vcpu in state {:?}", state)),
        }
    }

    /// A handle other threads can use to make the vcpu return to the scheduler.
    pub fn poke_handle(&self) -> PokeHandle {
        self.hm.borrow().poke_handle()
    }

    /// Queue an interrupt or exception for injection.
    ///
    /// Fails with `ResourceBusy` if another event is pending and the two do not combine.
    pub fn queue_event(&self, event: PendingEvent) -> AxResult<SetPendingOutcome> {
        self.hm.borrow_mut().hm.events.set_pending(event)
    }

    /// Sets the value of a general-purpose register according to the given index.
    pub fn set_gpr(&self, reg: usize, val: usize) {
        let mut hm = self.hm.borrow_mut();
        hm.context.gprs.set_reg_of_index(reg as u8, val as u64);
        hm.hm.dirty.mark_dirty(ContextGroups::GPRS);
    }

    /// Read the guest state.
    pub fn with_context<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&GuestContext) -> T,
    {
        f(&self.hm.borrow().context)
    }

    /// Change the guest state. `groups` are the register groups `f` modifies.
    pub fn with_context_mut<F, T>(&self, groups: ContextGroups, f: F) -> T
    where
        F: FnOnce(&mut GuestContext) -> T,
    {
        let mut hm = self.hm.borrow_mut();
        let result = f(&mut hm.context);
        hm.hm.dirty.mark_dirty(groups);
        result
    }

    /// Mark register groups as changed outside of [`AxVCpu::with_context_mut`].
    pub fn mark_dirty(&self, groups: ContextGroups) {
        self.hm.borrow_mut().hm.dirty.mark_dirty(groups);
    }

    /// Exceptions the host intercepts in the outer guest.
    pub fn set_exception_bitmap(&self, bitmap: u64) -> AxResult {
        let mut hm = self.hm.borrow_mut();
        hm.exception_bitmap = bitmap;
        let ext = match hm.hm.dirty.platform() {
            Platform::Vmx => ExtDirty::Vmx(VmxDirty::XCPT_INTERCEPTS),
            Platform::Svm => ExtDirty::Svm(SvmDirty::INTERCEPTS),
        };
        hm.hm.dirty.mark_ext_dirty(ext)
    }

    /// The TSC offset of the outer guest.
    pub fn set_tsc_offset(&self, offset: u64) -> AxResult {
        let mut hm = self.hm.borrow_mut();
        hm.tsc_offset = offset;
        let ext = match hm.hm.dirty.platform() {
            Platform::Vmx => ExtDirty::Vmx(VmxDirty::TSC_OFFSET),
            Platform::Svm => ExtDirty::Svm(SvmDirty::TSC_OFFSET),
        };
        hm.hm.dirty.mark_ext_dirty(ext)
    }

    /// Arm the VMX-preemption timer with `value` for every following entry, or disarm it.
    ///
    /// Fails with `Unsupported` on AMD-V.
    pub fn set_preemption_timer(&self, value: Option<u32>) -> AxResult {
        let mut hm = self.hm.borrow_mut();
        if hm.hm.dirty.platform() != Platform::Vmx {
            return ax_err!(Unsupported, "no preemption timer on this platform");
        }
        hm.preemption_timer = value;
        hm.hm
            .dirty
            .mark_ext_dirty(ExtDirty::Vmx(VmxDirty::PREEMPT_TIMER))
    }

    /// Start running the guest's own guest.
    ///
    /// `inner` are the control fields the guest hypervisor set up, `overrides` what the host
    /// needs on top of them, `nested_context` the nested guest's register state.
    pub fn enter_nested(
        &self,
        inner: &NestedFields,
        overrides: &NestedOverrides,
        nested_context: GuestContext,
    ) -> AxResult {
        let mut hm = self.hm.borrow_mut();
        let mut arch = self.arch_vcpu.borrow_mut();
        hm.enter_nested(&mut *arch, inner, overrides, nested_context)
    }

    /// Go back to the nested guest of the current nested session.
    pub fn resume_nested(&self) -> AxResult {
        self.hm.borrow_mut().resume_nested()
    }

    /// End the nested session, e.g. because the guest turned nested virtualization off.
    pub fn leave_nested(&self) {
        self.hm.borrow_mut().leave_nested();
    }

    /// The guest hypervisor's view of its nested control fields, as of the last nested exit.
    pub fn nested_view(&self) -> NestedFields {
        self.hm.borrow().nested_view
    }

    /// The guest modified or unmapped the page containing `addr`.
    ///
    /// Invalidates the cached translation (now if the vcpu's tag lives on the calling CPU,
    /// otherwise before the next entry) and drops the TPR patches on that page.
    pub fn invalidate_page(&self, addr: GuestVirtAddr) -> AxResult {
        let mut hm = self.hm.borrow_mut();
        let nested = hm.hm.mode == StructureKind::Nested;
        if let Some(scope) = hm.hm.tlb.invalidate_page(addr, nested, H::current_cpu_id()) {
            self.arch_vcpu.borrow_mut().invalidate_translation(scope)?;
        }
        hm.tpr.invalidate_page(addr);
        Ok(())
    }

    /// Execute a block with the TPR patch table.
    pub fn with_tpr_patches<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut TprPatchTable) -> T,
    {
        f(&mut self.hm.borrow_mut().tpr)
    }

    /// Execute a block with the exit history.
    pub fn with_exit_history<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&ExitHistory) -> T,
    {
        f(&self.hm.borrow().history)
    }

    /// Forget the exit history. Only affects performance.
    pub fn clear_exit_history(&self) {
        self.hm.borrow_mut().history.clear();
    }

    /// Execute a block with the hardware-assist state.
    pub fn with_hm_state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&VirtualCpuHmState) -> T,
    {
        f(&self.hm.borrow().hm)
    }

    /// Per exit reason counters.
    pub fn exit_stats(&self) -> ExitStats {
        self.hm.borrow().stats.clone()
    }

    /// Cached controls of the outer or nested control structure.
    pub fn control_snapshot(&self, kind: StructureKind) -> ControlSnapshot {
        self.hm.borrow().controls(kind).snapshot()
    }

    /// What stopped the vcpu, if a fatal error did.
    pub fn fatal_dump(&self) -> Option<FatalDump> {
        self.hm.borrow().fatal
    }
}
