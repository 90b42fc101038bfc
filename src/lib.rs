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

//! AxHm - hardware-assisted virtual CPU execution core for ArceOS hypervisors.
//!
//! This crate switches a physical CPU between host and guest through the primitives of a
//! hardware virtualization extension, supplied by an implementation of the [`AxArchVCpu`]
//! trait. Everything between the scheduler and those primitives lives here.
//!
//! # Features
//!
//! - State machine for VCpu lifecycle (Created → Free → Ready → Running)
//! - Dirty tracking of guest register groups, with a platform specific extension mask
//! - Address-space tag allocation and TLB flush decisions per physical CPU
//! - Event injection with the architectural double-fault rules, interrupted deliveries first
//! - Prime/restore cache of the nested control fields the host overrides
//! - Bounded resume loop with out-of-band cancellation
//! - Exit history, exit counters, TPR patch table and fatal state dumps

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate log;

// Core modules
mod addr; // Guest and host address types
mod arch_vcpu; // Hardware virtualization primitives
mod config; // Per-vcpu configuration
mod diag; // Exit counters and fatal dumps
mod dirty; // Context dirty tracker
mod event; // Event injector
mod exit; // Exit classification
mod hal; // Host services and collaborators
mod history; // Exit history recorder
mod mitigation; // Entry strategy
mod nested; // Nested control-field cache
mod percpu; // Per physical CPU virtualization state
mod regs; // Guest register context
mod switch; // World-switch coordinator
mod tlb; // Address-space tags and TLB flushes
mod tpr; // TPR patch table
mod vcpu; // Main VCpu implementation and state management
mod vmcs; // Control-structure fields and cache


// Public API exports
pub use addr::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};
pub use arch_vcpu::AxArchVCpu;
pub use config::{CpuFeatures, HmConfig, Platform};
pub use diag::{ExitStats, FatalDump, FatalReason};
pub use dirty::{ContextGroups, DirtyMask, DirtyTracker, ExtDirty, SvmDirty, VmxDirty};
pub use event::{EventInjector, EventKind, PendingEvent, SetPendingOutcome, vector};
pub use exit::{ClassifiedExit, ExitClass, basic_reason, classify, reason};
pub use hal::{AxHmHal, InstructionEmulator, NestedPagingProvider};
pub use history::{ExitDetail, ExitHistory, ExitHistoryEntry, ExitKey};
pub use mitigation::{EntryStrategy, MitigationStep};
pub use nested::{NestedCache, NestedField, NestedFieldSet, NestedFields, NestedOverrides};
pub use percpu::*;
pub use regs::{
    DebugRegisters, DescriptorTable, ExtendedState, GeneralRegisters, GuestContext, Segment,
    SegmentReg, SoftwareState,
};
pub use switch::{PokeHandle, VirtualCpuHmState, WorldSwitchPhase};
pub use tlb::{GENERATION_RESET, TagManager, TlbFlushKind, TlbScope, TlbTagState};
pub use tpr::{InstrBytes, MAX_TPR_PATCHES, TprPatch, TprPatchKind, TprPatchTable};
pub use vcpu::*;
pub use vmcs::{
    CachedControl, ControlSnapshot, ControlStructureInfo, FieldId, LaunchState, StructureKind,
    TagFlushMode, controls, field,
};
