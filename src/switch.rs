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

//! The world switch: running one slice of guest code on the current physical CPU.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{AxError, AxResult, ax_err};

use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::arch_vcpu::AxArchVCpu;
use crate::config::HmConfig;
use crate::diag::{ExitStats, FatalDump, FatalReason};
use crate::dirty::{ContextGroups, DirtyMask, DirtyTracker, ExtDirty, SvmDirty, VmxDirty};
use crate::event::{EventInjector, PendingEvent};
use crate::exit::{ClassifiedExit, ExitClass, basic_reason, classify, reason};
use crate::hal::{AxHmHal, InstructionEmulator, NestedPagingProvider};
use crate::history::{ExitHistory, ExitKey};
use crate::mitigation::EntryStrategy;
use crate::nested::{NestedCache, NestedField, NestedFields, NestedOverrides};
use crate::percpu::{ClaimError, PhysCpuRegistry, PhysCpuSlot};
use crate::regs::{GuestContext, SoftwareState};
use crate::tlb::TagManager;
use crate::tpr::TprPatchTable;
use crate::vmcs::{
    CachedControl, ControlStructureInfo, FieldId, LaunchState, StructureKind, TagFlushMode,
    controls, field,
};

/// Marks history keys of exits the emulator failed to handle.
const EMULATION_FAILED: u32 = 1 << 16;

/// Where a vcpu is in its world switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldSwitchPhase {
    /// Not running.
    Idle,
    /// Writing dirty state, TLB and event setup to the control structure.
    Exporting,
    /// Preemption disabled, entry mitigations running.
    Entering,
    /// The guest runs.
    InGuest,
    /// Back from the guest, preemption still disabled.
    Exiting,
    /// Importing and classifying the exit.
    Classifying,
}

/// Hardware-assist state of one vcpu.
///
/// Owned by the vcpu and only touched by the thread running it.
#[derive(Debug)]
pub struct VirtualCpuHmState {
    pub(crate) dirty: DirtyTracker,
    pub(crate) current_cpu: Option<usize>,
    pub(crate) previous_cpu: Option<usize>,
    pub(crate) tlb: TagManager,
    pub(crate) events: EventInjector,
    pub(crate) nested: NestedCache,
    pub(crate) phase: WorldSwitchPhase,
    pub(crate) last_exit: Option<u32>,
    pub(crate) last_error: Option<AxError>,
    pub(crate) mode: StructureKind,
    preempt_depth: u32,
    preempt_saved: usize,
}

impl VirtualCpuHmState {
    pub(crate) fn new(config: &HmConfig) -> Self {
        Self {
            dirty: DirtyTracker::new(config.platform),
            current_cpu: None,
            previous_cpu: None,
            tlb: TagManager::new(config),
            events: EventInjector::new(),
            nested: NestedCache::new(),
            phase: WorldSwitchPhase::Idle,
            last_exit: None,
            last_error: None,
            mode: StructureKind::Outer,
            preempt_depth: 0,
            preempt_saved: 0,
        }
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    /// The physical CPU of the last slice.
    pub fn current_cpu(&self) -> Option<usize> {
        self.current_cpu
    }

    /// The physical CPU before the last migration.
    pub fn previous_cpu(&self) -> Option<usize> {
        self.previous_cpu
    }

    pub fn tlb(&self) -> &TagManager {
        &self.tlb
    }

    pub fn events(&self) -> &EventInjector {
        &self.events
    }

    pub fn nested_valid(&self) -> bool {
        self.nested.is_valid()
    }

    pub fn phase(&self) -> WorldSwitchPhase {
        self.phase
    }

    /// Raw exit reason of the last exit.
    pub fn last_exit_reason(&self) -> Option<u32> {
        self.last_exit
    }

    /// Error of the last failed slice.
    pub fn last_error(&self) -> Option<AxError> {
        self.last_error
    }

    /// The structure the vcpu runs on: the guest itself or its nested guest.
    pub fn mode(&self) -> StructureKind {
        self.mode
    }

    /// Disable preemption for the critical section.
    ///
    /// Disabling again before the previous disable was restored is a fatal error.
    pub(crate) fn disable_preemption<H: AxHmHal>(&mut self) -> Result<(), FatalReason> {
        if self.preempt_depth != 0 {
            return Err(FatalReason::UnbalancedPreemption {
                depth: self.preempt_depth,
            });
        }
        self.preempt_saved = H::preempt_disable();
        self.preempt_depth = 1;
        Ok(())
    }

    pub(crate) fn restore_preemption<H: AxHmHal>(&mut self) {
        if self.preempt_depth == 0 {
            error!("preemption restored without being disabled");
            return;
        }
        self.preempt_depth -= 1;
        H::preempt_restore(self.preempt_saved);
    }
}

/// Requests a running vcpu to return to the scheduler.
///
/// Can be cloned and sent to other threads. The request is honoured the next time the guest
/// exits; it never interrupts the guest by itself. Pair it with an inter-processor interrupt
/// to force an exit.
#[derive(Debug, Clone)]
pub struct PokeHandle(Arc<AtomicBool>);

impl PokeHandle {
    /// Ask the vcpu to stop resuming the guest.
    pub fn poke(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a request is outstanding.
    pub fn is_poked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct SwitchOutcome {
    exit: ClassifiedExit,
    resumable: bool,
    cancelled: bool,
}

/// The world-switch coordinator of one vcpu.
pub(crate) struct WorldSwitch<H: AxHmHal> {
    pub(crate) hm: VirtualCpuHmState,
    /// Guest state of the level currently run.
    pub(crate) context: GuestContext,
    /// Guest state of the other level while the vcpu runs the nested guest, or the nested
    /// guest's state while it runs the outer guest.
    pub(crate) parked: Option<GuestContext>,
    pub(crate) outer: ControlStructureInfo,
    pub(crate) nested_ctl: ControlStructureInfo,
    /// The guest hypervisor's own view of its nested control fields.
    pub(crate) nested_view: NestedFields,
    pub(crate) history: ExitHistory,
    pub(crate) stats: ExitStats,
    pub(crate) tpr: TprPatchTable,
    pub(crate) exception_bitmap: u64,
    pub(crate) tsc_offset: u64,
    /// VMX-preemption timer value, `None` when the timer is disarmed.
    pub(crate) preemption_timer: Option<u32>,
    config: HmConfig,
    registry: Arc<PhysCpuRegistry>,
    strategy: EntryStrategy,
    cancel: Arc<AtomicBool>,
    ept_root: Option<(StructureKind, HostPhysAddr)>,
    pub(crate) fatal: Option<FatalDump>,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxHmHal> WorldSwitch<H> {
    pub(crate) fn new(config: HmConfig, registry: Arc<PhysCpuRegistry>) -> Self {
        let tag_mode = if config.tags_supported {
            TagFlushMode::SingleContext
        } else {
            TagFlushMode::NotSupported
        };
        Self {
            hm: VirtualCpuHmState::new(&config),
            context: GuestContext::default(),
            parked: None,
            outer: ControlStructureInfo::new(StructureKind::Outer, tag_mode),
            nested_ctl: ControlStructureInfo::new(StructureKind::Nested, tag_mode),
            nested_view: NestedFields::default(),
            history: ExitHistory::new(),
            stats: ExitStats::new(),
            tpr: TprPatchTable::new(),
            exception_bitmap: 0,
            tsc_offset: 0,
            preemption_timer: config.preemption_timer,
            strategy: EntryStrategy::new(config.cpu_features),
            config,
            registry,
            cancel: Arc::new(AtomicBool::new(false)),
            ept_root: None,
            fatal: None,
            _hal: PhantomData,
        }
    }

    pub(crate) fn poke_handle(&self) -> PokeHandle {
        PokeHandle(self.cancel.clone())
    }

    pub(crate) fn controls(&self, kind: StructureKind) -> &ControlStructureInfo {
        match kind {
            StructureKind::Outer => &self.outer,
            StructureKind::Nested => &self.nested_ctl,
        }
    }

    fn controls_mut(&mut self, kind: StructureKind) -> &mut ControlStructureInfo {
        match kind {
            StructureKind::Outer => &mut self.outer,
            StructureKind::Nested => &mut self.nested_ctl,
        }
    }

    /// Stop the vcpu for good, keeping enough state to analyse the failure.
    fn fatal(&mut self, reason: FatalReason) -> AxError {
        let dump = FatalDump {
            reason,
            last_exit_reason: self.hm.last_exit,
            phys_cpu: self.hm.current_cpu,
            controls: self.controls(self.hm.mode).snapshot(),
        };
        error!("vcpu stopped: {}", dump);
        self.fatal = Some(dump);
        AxError::BadState
    }

    /// Forget all per-VM state: full virtual machine reset.
    pub(crate) fn reset(&mut self) {
        self.hm.dirty.mark_all();
        self.hm.tlb.reset();
        self.hm.events.clear();
        self.hm.nested.invalidate();
        self.hm.mode = StructureKind::Outer;
        self.hm.last_exit = None;
        self.hm.last_error = None;
        self.context = GuestContext::default();
        self.parked = None;
        self.outer.mark_cleared();
        self.outer.invalidate_cache();
        self.nested_ctl.mark_cleared();
        self.nested_ctl.invalidate_cache();
        self.nested_view = NestedFields::default();
        self.history.clear();
        self.tpr.clear();
        self.ept_root = None;
        self.cancel.store(false, Ordering::Release);
        debug!("hardware-assist state reset");
    }

    /// Switch the vcpu to the nested guest described by `inner`.
    pub(crate) fn enter_nested<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        inner: &NestedFields,
        overrides: &NestedOverrides,
        nested_context: GuestContext,
    ) -> AxResult {
        if self.hm.mode == StructureKind::Nested {
            return ax_err!(BadState, "already running the nested guest");
        }
        let merged = self.hm.nested.prime(inner, overrides);
        for field in NestedField::ALL {
            let value = merged.get(field);
            if let Err(err) = arch.write_field(StructureKind::Nested, field.field(), value) {
                self.hm.nested.invalidate();
                self.nested_ctl.invalidate_cache();
                return Err(err);
            }
        }
        // Written behind the cache's back.
        self.nested_ctl.invalidate_cache();
        self.nested_view = *inner;
        let outer = mem::replace(&mut self.context, nested_context);
        self.parked = Some(outer);
        self.switch_level(StructureKind::Nested);
        Ok(())
    }

    /// Re-enter the nested guest of the current, still valid, nested session.
    pub(crate) fn resume_nested(&mut self) -> AxResult {
        if self.hm.mode == StructureKind::Nested {
            return ax_err!(BadState, "already running the nested guest");
        }
        let Some(parked) = self.parked.as_mut() else {
            return ax_err!(BadState, "no nested guest to resume");
        };
        self.hm.nested.rearm()?;
        mem::swap(&mut self.context, parked);
        self.switch_level(StructureKind::Nested);
        Ok(())
    }

    /// End the nested session.
    pub(crate) fn leave_nested(&mut self) {
        self.hm.nested.invalidate();
        if self.hm.mode == StructureKind::Nested {
            if let Some(outer) = self.parked.take() {
                self.context = outer;
            }
            self.switch_level(StructureKind::Outer);
        } else {
            self.parked = None;
        }
        self.nested_ctl.mark_cleared();
    }

    fn switch_level(&mut self, mode: StructureKind) {
        self.hm.mode = mode;
        self.hm.tlb.nested_switch();
        // The software copy now belongs to the other structure.
        self.hm.dirty.mark_dirty(ContextGroups::all());
        trace!("switched to {:?} guest", mode);
    }

    /// Run the guest on the current physical CPU until an exit that needs the scheduler, the
    /// resume bound is reached, or somebody pokes the vcpu.
    pub(crate) fn run_slice<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        paging: &mut dyn NestedPagingProvider,
        emulator: Option<&mut dyn InstructionEmulator>,
    ) -> AxResult<ClassifiedExit> {
        if self.fatal.is_some() {
            return ax_err!(BadState, "vcpu stopped after a fatal error");
        }
        let registry = self.registry.clone();
        let cpu = H::current_cpu_id();
        let claim = match registry.claim(cpu) {
            Ok(claim) => claim,
            Err(ClaimError::AlreadyClaimed) => {
                self.hm.current_cpu = Some(cpu);
                return Err(self.fatal(FatalReason::CpuAlreadyClaimed));
            }
            Err(err) => {
                warn!("physical CPU {} cannot run guests: {:?}", cpu, err);
                return ax_err!(BadState, "physical CPU not configured for virtualization");
            }
        };

        if self.hm.current_cpu != Some(cpu) {
            if self.hm.current_cpu.is_some() {
                // Control structures are bound to the CPU they were launched on.
                self.outer.mark_cleared();
                self.nested_ctl.mark_cleared();
            }
            self.hm.previous_cpu = self.hm.current_cpu;
            self.hm.current_cpu = Some(cpu);
        }

        let result = self.resume_loop(arch, claim.slot(), paging, emulator);
        self.hm.phase = WorldSwitchPhase::Idle;
        drop(claim);
        if let Err(err) = &result {
            self.hm.last_error = Some(*err);
        }
        result
    }

    fn resume_loop<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        slot: &PhysCpuSlot,
        paging: &mut dyn NestedPagingProvider,
        mut emulator: Option<&mut dyn InstructionEmulator>,
    ) -> AxResult<ClassifiedExit> {
        let mut resumes = 0;
        loop {
            let SwitchOutcome {
                exit,
                resumable,
                cancelled,
            } = self.switch_once(
                arch,
                slot,
                paging,
                emulator
                    .as_mut()
                    .map(|emulator| &mut **emulator as &mut dyn InstructionEmulator),
            )?;

            if !resumable {
                return Ok(exit);
            }
            if cancelled {
                debug!("vcpu poked, back to the scheduler");
                return Ok(exit);
            }
            if resumes >= self.config.max_resume_loops {
                trace!("resume bound {} reached", self.config.max_resume_loops);
                return Ok(exit);
            }
            resumes += 1;
            self.stats.count_resume();
        }
    }

    fn switch_once<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        slot: &PhysCpuSlot,
        paging: &mut dyn NestedPagingProvider,
        emulator: Option<&mut dyn InstructionEmulator>,
    ) -> AxResult<SwitchOutcome> {
        let mode = self.hm.mode;
        let nested = mode == StructureKind::Nested;

        self.hm.phase = WorldSwitchPhase::Exporting;
        self.export_state(arch)?;

        let flush = self.hm.tlb.prepare_entry(slot);
        if let Some(scope) = self.hm.tlb.scope_for(flush, nested) {
            trace!("flushing {:?}", scope);
            arch.invalidate_translation(scope)?;
        }
        self.hm.tlb.flush_done(flush, slot);
        if self.config.tags_supported {
            let tag = self.hm.tlb.active_tag(nested) as u64;
            self.controls_mut(mode)
                .write(arch, CachedControl::Vpid, tag)?;
        }

        let root = paging.root_pointer();
        if self.ept_root != Some((mode, root)) {
            arch.write_field(mode, field::EPT_POINTER, root.as_usize() as u64)?;
            self.ept_root = Some((mode, root));
        }

        let injected = self.inject_event(arch, mode)?;

        let launch = self.controls(mode).launch_state() == LaunchState::Clear;
        if launch {
            if let Err(err) = self.controls(mode).verify(arch) {
                self.put_back(injected);
                return Err(match err {
                    AxError::InvalidData => self.fatal(FatalReason::ReadbackMismatch),
                    other => other,
                });
            }
        }

        self.hm.phase = WorldSwitchPhase::Entering;
        if let Err(reason) = self.hm.disable_preemption::<H>() {
            self.put_back(injected);
            return Err(self.fatal(reason));
        }
        self.hm.phase = WorldSwitchPhase::InGuest;
        let entered = self
            .strategy
            .enter(arch, mode, launch, &mut self.context.gprs);
        self.hm.phase = WorldSwitchPhase::Exiting;
        self.hm.restore_preemption::<H>();
        let cancelled = self.cancel.swap(false, Ordering::AcqRel);
        self.hm.phase = WorldSwitchPhase::Classifying;

        let raw = match entered {
            Ok(raw) => raw,
            Err(_) => {
                let error = arch
                    .read_field(mode, field::VM_INSTRUCTION_ERROR)
                    .unwrap_or_default();
                self.put_back(injected);
                self.stats.count_entry_failure();
                return Err(self.fatal(FatalReason::EntryInstruction { error }));
            }
        };
        self.hm.last_exit = Some(raw);
        if raw & reason::ENTRY_FAILURE != 0 {
            let qualification = arch
                .read_field(mode, field::EXIT_QUALIFICATION)
                .unwrap_or_default();
            self.put_back(injected);
            self.stats.count_entry_failure();
            return Err(self.fatal(FatalReason::EntryFailed { qualification }));
        }
        if launch {
            self.controls_mut(mode).mark_launched();
        }

        let mut exit = ClassifiedExit::new(classify(raw, mode), basic_reason(raw), mode);
        if let Err(err) = self.import_state(arch, &mut exit) {
            warn!("importing guest state failed: {:?}", err);
            self.hm.dirty.mark_import_failed();
            return Err(err);
        }

        self.stats.count_exit(exit.reason);
        self.history
            .record(ExitKey::new(exit.rip, exit.reason), H::timestamp());
        trace!(
            "exit {} at {:#x} on {:?}: {:?}",
            exit.reason,
            exit.rip,
            mode,
            exit.class
        );

        let resumable = match exit.class {
            ExitClass::InterruptWindow => {
                self.controls_mut(mode).update_bits(
                    arch,
                    CachedControl::ProcControls,
                    controls::PROC_INTERRUPT_WINDOW_EXITING,
                    false,
                )?;
                true
            }
            ExitClass::NestedVmExit if nested => {
                self.finish_nested_exit(arch)?;
                false
            }
            ExitClass::Fault if exit.reason == reason::EPT_MISCONFIG => {
                if let Some(gpa) = exit.guest_phys_addr {
                    paging.page_tables_stale(gpa);
                }
                false
            }
            ExitClass::Unsupported => self.try_emulate(&mut exit, emulator)?,
            _ => false,
        };

        Ok(SwitchOutcome {
            exit,
            resumable,
            cancelled,
        })
    }

    /// Write everything dirty to the active structure.
    ///
    /// Only what was actually written is cleared; a failure leaves the rest dirty for the next
    /// attempt.
    fn export_state<A: AxArchVCpu>(&mut self, arch: &mut A) -> AxResult {
        let pending = self.hm.dirty.export_pending();
        if pending.is_empty() {
            return Ok(());
        }
        let mut exported = DirtyMask {
            generic: ContextGroups::empty(),
            ext: ExtDirty::empty(self.hm.dirty.platform()),
        };
        let result = self.export_groups(arch, &pending, &mut exported);
        self.hm.dirty.clear_after_export(&exported)?;
        result
    }

    fn export_groups<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        pending: &DirtyMask,
        exported: &mut DirtyMask,
    ) -> AxResult {
        let mode = self.hm.mode;
        for group in pending.generic.iter() {
            export_group(arch, mode, &self.context, group)?;
            exported.generic |= group;
        }

        // Extension state only applies to the outer structure; while the nested guest runs
        // it comes from priming and stays dirty.
        if mode != StructureKind::Outer {
            return Ok(());
        }
        match (pending.ext, &mut exported.ext) {
            (ExtDirty::Vmx(bits), ExtDirty::Vmx(done)) => {
                for bit in bits.iter() {
                    if bit == VmxDirty::XCPT_INTERCEPTS {
                        self.outer
                            .write(arch, CachedControl::ExceptionBitmap, self.exception_bitmap)?;
                    } else if bit == VmxDirty::TSC_OFFSET {
                        self.outer
                            .write(arch, CachedControl::TscOffset, self.tsc_offset)?;
                    } else if bit == VmxDirty::PREEMPT_TIMER {
                        if let Some(value) = self.preemption_timer {
                            arch.write_field(mode, field::VMX_PREEMPTION_TIMER_VALUE, value as u64)?;
                        }
                        self.outer.update_bits(
                            arch,
                            CachedControl::PinControls,
                            controls::PIN_PREEMPTION_TIMER,
                            self.preemption_timer.is_some(),
                        )?;
                    } else if bit == VmxDirty::PROC_CONTROLS {
                        self.export_proc_controls(arch)?;
                    }
                    *done |= bit;
                }
            }
            (ExtDirty::Svm(bits), ExtDirty::Svm(done)) => {
                for bit in bits.iter() {
                    if bit == SvmDirty::INTERCEPTS {
                        self.outer
                            .write(arch, CachedControl::ExceptionBitmap, self.exception_bitmap)?;
                    } else if bit == SvmDirty::TSC_OFFSET {
                        self.outer
                            .write(arch, CachedControl::TscOffset, self.tsc_offset)?;
                    }
                    *done |= bit;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Secondary controls with EPT always on, VPID whenever tags are in use.
    fn export_proc_controls<A: AxArchVCpu>(&mut self, arch: &mut A) -> AxResult {
        self.outer.update_bits(
            arch,
            CachedControl::ProcControls,
            controls::PROC_SECONDARY_CONTROLS,
            true,
        )?;
        self.outer.update_bits(
            arch,
            CachedControl::ProcControls2,
            controls::PROC2_ENABLE_EPT,
            true,
        )?;
        self.outer.update_bits(
            arch,
            CachedControl::ProcControls2,
            controls::PROC2_ENABLE_VPID,
            self.config.tags_supported,
        )
    }

    /// Program the pending event, if it can be delivered, and arm the interrupt window.
    fn inject_event<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        mode: StructureKind,
    ) -> AxResult<Option<PendingEvent>> {
        let event = self.hm.events.consume(self.context.interrupts_open());
        if let Some(event) = event {
            if let Err(err) = write_event(arch, mode, &event) {
                self.hm.events.reinject(event);
                return Err(err);
            }
            if let Some(addr) = event.fault_addr {
                self.context.cr2 = addr.as_usize() as u64;
            }
            trace!("injecting {:?}", event);
        }
        if self.hm.events.interrupt_window_wanted() {
            self.controls_mut(mode).update_bits(
                arch,
                CachedControl::ProcControls,
                controls::PROC_INTERRUPT_WINDOW_EXITING,
                true,
            )?;
            self.hm.events.clear_window_request();
        }
        Ok(event)
    }

    /// Return an event consumed for an entry that never happened.
    fn put_back(&mut self, injected: Option<PendingEvent>) {
        if let Some(event) = injected {
            self.hm.events.reinject(event);
        }
    }

    /// Read the guest state the exit changed back into the software copy.
    fn import_state<A: AxArchVCpu>(&mut self, arch: &A, exit: &mut ClassifiedExit) -> AxResult {
        let mode = exit.mode;
        let read = |field: FieldId| arch.read_field(mode, field);

        self.context.rip = read(field::GUEST_RIP)?;
        self.context.rsp = read(field::GUEST_RSP)?;
        self.context.rflags = read(field::GUEST_RFLAGS)?;
        self.context.interruptibility = read(field::GUEST_INTERRUPTIBILITY)? as u32;

        exit.rip = self.context.rip;
        exit.qualification = read(field::EXIT_QUALIFICATION)?;
        exit.instr_len = read(field::EXIT_INSTRUCTION_LEN)? as u32;
        match exit.reason {
            reason::EXCEPTION_NMI => {
                exit.exception = PendingEvent::from_idt_vectoring(
                    read(field::EXIT_INTERRUPTION_INFO)? as u32,
                    read(field::EXIT_INTERRUPTION_ERRCODE)? as u32,
                    exit.instr_len,
                );
            }
            reason::EPT_VIOLATION | reason::EPT_MISCONFIG => {
                exit.guest_phys_addr = Some(GuestPhysAddr::from_usize(
                    read(field::GUEST_PHYSICAL_ADDR)? as usize,
                ));
            }
            _ => {}
        }

        let vectoring = read(field::IDT_VECTORING_INFO)? as u32;
        if let Some(event) = PendingEvent::from_idt_vectoring(
            vectoring,
            read(field::IDT_VECTORING_ERRCODE)? as u32,
            exit.instr_len,
        ) {
            if mode == StructureKind::Nested && exit.class == ExitClass::NestedVmExit {
                debug!("event {:?} left to the guest hypervisor", event);
                exit.interrupted = Some(event);
            } else {
                debug!("event {:?} was not delivered, re-injecting", event);
                self.hm.events.reinject(event);
            }
        }
        Ok(())
    }

    /// The nested guest exited to the guest hypervisor: hand back its view of the controls and
    /// switch to the outer guest.
    fn finish_nested_exit<A: AxArchVCpu>(&mut self, arch: &mut A) -> AxResult {
        let fields = self
            .hm
            .nested
            .restore(|field| arch.read_field(StructureKind::Nested, field.field()))?;
        for (field, value) in fields {
            self.nested_view.set(field, value);
        }
        if let Some(parked) = self.parked.as_mut() {
            mem::swap(&mut self.context, parked);
        }
        self.switch_level(StructureKind::Outer);
        Ok(())
    }

    /// Offer an exit the core cannot handle to the instruction emulator.
    ///
    /// Returns whether the guest can be resumed right away.
    fn try_emulate(
        &mut self,
        exit: &mut ClassifiedExit,
        emulator: Option<&mut dyn InstructionEmulator>,
    ) -> AxResult<bool> {
        let Some(emulator) = emulator else {
            return Ok(false);
        };
        let failed = ExitKey::new(exit.rip, exit.reason | EMULATION_FAILED);
        if self.history.lookup(failed) >= self.config.emulation_skip_threshold {
            debug!(
                "not emulating exit {} at {:#x}, it keeps failing",
                exit.reason, exit.rip
            );
            return Ok(false);
        }
        if emulator.emulate(exit, &mut self.context, &mut self.tpr)? {
            exit.emulated = true;
            self.hm.dirty.mark_dirty(
                ContextGroups::GPRS | ContextGroups::RIP | ContextGroups::RSP | ContextGroups::RFLAGS,
            );
            Ok(true)
        } else {
            self.history.record(failed, H::timestamp());
            Ok(false)
        }
    }
}

fn export_group<A: AxArchVCpu>(
    arch: &mut A,
    mode: StructureKind,
    ctx: &GuestContext,
    group: ContextGroups,
) -> AxResult {
    let software = if group == ContextGroups::CR2 {
        Some(SoftwareState::Cr2(ctx.cr2))
    } else if group == ContextGroups::DEBUG {
        Some(SoftwareState::Debug(ctx.debug))
    } else if group == ContextGroups::FPU {
        Some(SoftwareState::Extended(ctx.xstate))
    } else {
        None
    };
    if let Some(state) = software {
        return arch.load_software_state(mode, state);
    }

    let mut fields = vec![];
    if group == ContextGroups::SEGMENTS || group == ContextGroups::SYS_SEGMENTS {
        let range = if group == ContextGroups::SEGMENTS { 0..6 } else { 6..8 };
        for index in range {
            let segment = &ctx.segments[index];
            fields.extend([
                (field::guest_selector(index), segment.selector as u64),
                (field::guest_segment_base(index), segment.base),
                (field::guest_segment_limit(index), segment.limit as u64),
                (
                    field::guest_segment_access_rights(index),
                    segment.access_rights as u64,
                ),
            ]);
        }
    } else if group == ContextGroups::DESC_TABLES {
        fields.extend([
            (field::GUEST_GDTR_BASE, ctx.gdtr.base),
            (field::GUEST_GDTR_LIMIT, ctx.gdtr.limit as u64),
            (field::GUEST_IDTR_BASE, ctx.idtr.base),
            (field::GUEST_IDTR_LIMIT, ctx.idtr.limit as u64),
        ]);
    } else if group == ContextGroups::MSRS {
        fields.extend([
            (field::GUEST_SYSENTER_CS, ctx.sysenter_cs),
            (field::GUEST_SYSENTER_ESP, ctx.sysenter_esp),
            (field::GUEST_SYSENTER_EIP, ctx.sysenter_eip),
            (field::GUEST_IA32_PAT, ctx.pat),
        ]);
    } else {
        // GPRs travel with the entry itself.
        let single = [
            (ContextGroups::RIP, field::GUEST_RIP, ctx.rip),
            (ContextGroups::RSP, field::GUEST_RSP, ctx.rsp),
            (ContextGroups::RFLAGS, field::GUEST_RFLAGS, ctx.rflags),
            (ContextGroups::CR0, field::GUEST_CR0, ctx.cr0),
            (ContextGroups::CR3, field::GUEST_CR3, ctx.cr3),
            (ContextGroups::CR4, field::GUEST_CR4, ctx.cr4),
            (ContextGroups::DR7, field::GUEST_DR7, ctx.dr7),
            (ContextGroups::EFER, field::GUEST_IA32_EFER, ctx.efer),
            (
                ContextGroups::INTERRUPTIBILITY,
                field::GUEST_INTERRUPTIBILITY,
                ctx.interruptibility as u64,
            ),
            (ContextGroups::HWVIRT, field::VMCS_LINK_POINTER, ctx.vmcs_link),
        ];
        fields.extend(
            single
                .iter()
                .filter(|(g, ..)| *g == group)
                .map(|(_, field, value)| (*field, *value)),
        );
    }
    for (field, value) in fields {
        arch.write_field(mode, field, value)?;
    }
    Ok(())
}

fn write_event<A: AxArchVCpu>(arch: &mut A, mode: StructureKind, event: &PendingEvent) -> AxResult {
    if let Some(addr) = event.fault_addr {
        arch.load_software_state(mode, SoftwareState::Cr2(addr.as_usize() as u64))?;
    }
    if let Some(error_code) = event.error_code {
        arch.write_field(mode, field::VMENTRY_EXCEPTION_ERRCODE, error_code as u64)?;
    }
    if let Some(len) = event.instr_len {
        arch.write_field(mode, field::VMENTRY_INSTRUCTION_LEN, len as u64)?;
    }
    arch.write_field(mode, field::VMENTRY_INTERRUPTION_INFO, event.encode() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    thread_local! {
        static DISABLED: Cell<usize> = const { Cell::new(0) };
    }

    struct CountingHal;

    impl AxHmHal for CountingHal {
        fn current_cpu_id() -> usize {
            0
        }

        fn preempt_disable() -> usize {
            DISABLED.with(|count| count.set(count.get() + 1));
            0x200
        }

        fn preempt_restore(saved: usize) {
            assert_eq!(saved, 0x200);
            DISABLED.with(|count| count.set(count.get() - 1));
        }
    }

    #[test]
    fn double_preempt_disable_is_refused() {
        let mut hm = VirtualCpuHmState::new(&HmConfig::default());
        hm.disable_preemption::<CountingHal>().unwrap();
        assert_eq!(
            hm.disable_preemption::<CountingHal>(),
            Err(FatalReason::UnbalancedPreemption { depth: 1 })
        );
        assert_eq!(DISABLED.with(|count| count.get()), 1);

        hm.restore_preemption::<CountingHal>();
        assert_eq!(DISABLED.with(|count| count.get()), 0);
        // Unbalanced restores are ignored.
        hm.restore_preemption::<CountingHal>();
        assert_eq!(DISABLED.with(|count| count.get()), 0);
    }

    #[test]
    fn poke_handle_is_shared() {
        let ws = WorldSwitch::<CountingHal>::new(
            HmConfig::default(),
            Arc::new(PhysCpuRegistry::new(1)),
        );
        let handle = ws.poke_handle();
        let other = handle.clone();
        other.poke();
        assert!(handle.is_poked());
        assert!(ws.cancel.swap(false, Ordering::AcqRel));
        assert!(!handle.is_poked());
    }
}
