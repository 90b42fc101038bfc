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

//! Cache of the nested control fields the host overrides while the guest's own guest runs.
//!
//! When the guest hypervisor launches its guest, the host cannot use the guest hypervisor's
//! control fields as they are: the host's own intercepts must stay armed and the TSC offset
//! must account for both levels. [`NestedCache::prime`] computes the merged fields actually
//! written to hardware and remembers which ones differ; on the nested exit
//! [`NestedCache::restore`] tells the caller what to put back so the guest hypervisor sees
//! its own values again.

use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use crate::vmcs::{FieldId, controls, field};

/// A nested control field tracked by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedField {
    PinControls = 0,
    ProcControls = 1,
    ProcControls2 = 2,
    EntryControls = 3,
    ExitControls = 4,
    ExceptionBitmap = 5,
    Cr0Mask = 6,
    Cr4Mask = 7,
    TscOffset = 8,
    PleGap = 9,
    PleWindow = 10,
    /// VM-entry interruption information. The processor clears its valid bit on entry.
    EventInjection = 11,
    /// Guest interruptibility state. Updated by the processor on every exit.
    InterruptShadow = 12,
}

const FIELD_COUNT: usize = 13;

impl NestedField {
    /// Every tracked field.
    pub const ALL: [Self; FIELD_COUNT] = [
        Self::PinControls,
        Self::ProcControls,
        Self::ProcControls2,
        Self::EntryControls,
        Self::ExitControls,
        Self::ExceptionBitmap,
        Self::Cr0Mask,
        Self::Cr4Mask,
        Self::TscOffset,
        Self::PleGap,
        Self::PleWindow,
        Self::EventInjection,
        Self::InterruptShadow,
    ];

    /// The hardware encoding of the field.
    pub const fn field(self) -> FieldId {
        match self {
            Self::PinControls => field::PIN_BASED_EXEC_CONTROLS,
            Self::ProcControls => field::PROC_BASED_EXEC_CONTROLS,
            Self::ProcControls2 => field::SECONDARY_PROC_BASED_EXEC_CONTROLS,
            Self::EntryControls => field::VMENTRY_CONTROLS,
            Self::ExitControls => field::VMEXIT_CONTROLS,
            Self::ExceptionBitmap => field::EXCEPTION_BITMAP,
            Self::Cr0Mask => field::CR0_GUEST_HOST_MASK,
            Self::Cr4Mask => field::CR4_GUEST_HOST_MASK,
            Self::TscOffset => field::TSC_OFFSET,
            Self::PleGap => field::PLE_GAP,
            Self::PleWindow => field::PLE_WINDOW,
            Self::EventInjection => field::VMENTRY_INTERRUPTION_INFO,
            Self::InterruptShadow => field::GUEST_INTERRUPTIBILITY,
        }
    }

    /// The set containing only this field.
    pub const fn bit(self) -> NestedFieldSet {
        NestedFieldSet::from_bits_retain(1 << self as u32)
    }
}

bitflags::bitflags! {
    /// A set of [`NestedField`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NestedFieldSet: u32 {
        const PIN_CONTROLS = 1 << 0;
        const PROC_CONTROLS = 1 << 1;
        const PROC_CONTROLS2 = 1 << 2;
        const ENTRY_CONTROLS = 1 << 3;
        const EXIT_CONTROLS = 1 << 4;
        const EXCEPTION_BITMAP = 1 << 5;
        const CR0_MASK = 1 << 6;
        const CR4_MASK = 1 << 7;
        const TSC_OFFSET = 1 << 8;
        const PLE_GAP = 1 << 9;
        const PLE_WINDOW = 1 << 10;
        const EVENT_INJECTION = 1 << 11;
        const INTERRUPT_SHADOW = 1 << 12;
    }
}

impl NestedFieldSet {
    /// Fields the processor itself rewrites during a nested run. The guest hypervisor must
    /// see the hardware values after the exit, never the ones it wrote.
    pub const HW_WRITEBACK: Self = Self::EVENT_INJECTION.union(Self::INTERRUPT_SHADOW);
}

/// Values of all tracked nested fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NestedFields {
    values: [u64; FIELD_COUNT],
}

impl NestedFields {
    /// Value of `field`.
    pub fn get(&self, field: NestedField) -> u64 {
        self.values[field as usize]
    }

    /// Set `field` to `value`.
    pub fn set(&mut self, field: NestedField, value: u64) {
        self.values[field as usize] = value;
    }

    /// Builder-style [`NestedFields::set`].
    pub fn with(mut self, field: NestedField, value: u64) -> Self {
        self.set(field, value);
        self
    }
}

/// The outer host's requirements for any nested run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NestedOverrides {
    pub pin_controls: u64,
    pub proc_controls: u64,
    pub proc_controls2: u64,
    pub entry_controls: u64,
    pub exit_controls: u64,
    /// Exceptions the host must intercept no matter what the guest hypervisor wants.
    pub exception_bitmap: u64,
    pub cr0_mask: u64,
    pub cr4_mask: u64,
    /// The host's TSC offset for the outer guest.
    pub tsc_offset: u64,
    /// PAUSE-loop exiting (gap, window) the host wants when the guest hypervisor has it off.
    pub pause_filter: Option<(u32, u32)>,
    /// Whether the processor supports LBR virtualization for the nested guest. Without it the
    /// corresponding entry/exit control bits are stripped.
    pub lbr_virt_supported: bool,
}

/// Entry/exit control bits that load and save `IA32_DEBUGCTL` (LBR virtualization).
const ENTRY_LOAD_DEBUGCTL: u64 = 1 << 2;
const EXIT_SAVE_DEBUGCTL: u64 = 1 << 2;

/// The nested control-field cache of one vcpu.
#[derive(Debug)]
pub struct NestedCache {
    inner: NestedFields,
    overridden: NestedFieldSet,
    valid: bool,
    restore_pending: bool,
}

impl Default for NestedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NestedCache {
    /// An empty, invalid cache.
    pub const fn new() -> Self {
        Self {
            inner: NestedFields {
                values: [0; FIELD_COUNT],
            },
            overridden: NestedFieldSet::empty(),
            valid: false,
            restore_pending: false,
        }
    }

    /// Whether the cache holds a completely primed nested run.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Fields the last priming changed.
    pub fn overridden(&self) -> NestedFieldSet {
        self.overridden
    }

    /// Merge the guest hypervisor's `inner` fields with the host's `overrides`.
    ///
    /// Returns the fields to write to hardware for the nested run. The cache becomes valid only
    /// once everything has been computed.
    pub fn prime(&mut self, inner: &NestedFields, overrides: &NestedOverrides) -> NestedFields {
        self.valid = false;

        let inner_ple =
            inner.get(NestedField::ProcControls2) & controls::PROC2_PAUSE_LOOP_EXITING != 0;
        let mut proc2 = inner.get(NestedField::ProcControls2) | overrides.proc_controls2;
        let mut entry = inner.get(NestedField::EntryControls) | overrides.entry_controls;
        let mut exit = inner.get(NestedField::ExitControls) | overrides.exit_controls;
        if !overrides.lbr_virt_supported {
            entry &= !ENTRY_LOAD_DEBUGCTL;
            exit &= !EXIT_SAVE_DEBUGCTL;
        }

        let mut merged = *inner;
        use NestedField::*;
        merged.set(PinControls, inner.get(PinControls) | overrides.pin_controls);
        merged.set(ProcControls, inner.get(ProcControls) | overrides.proc_controls);
        merged.set(EntryControls, entry);
        merged.set(ExitControls, exit);
        merged.set(
            ExceptionBitmap,
            inner.get(ExceptionBitmap) | overrides.exception_bitmap,
        );
        merged.set(Cr0Mask, inner.get(Cr0Mask) | overrides.cr0_mask);
        merged.set(Cr4Mask, inner.get(Cr4Mask) | overrides.cr4_mask);
        merged.set(
            TscOffset,
            inner.get(TscOffset).wrapping_add(overrides.tsc_offset),
        );
        if let (false, Some((gap, window))) = (inner_ple, overrides.pause_filter) {
            proc2 |= controls::PROC2_PAUSE_LOOP_EXITING;
            merged.set(PleGap, gap as u64);
            merged.set(PleWindow, window as u64);
        }
        merged.set(ProcControls2, proc2);

        let mut overridden = NestedFieldSet::empty();
        for field in NestedField::ALL {
            if merged.get(field) != inner.get(field) {
                overridden |= field.bit();
            }
        }

        self.inner = *inner;
        self.overridden = overridden;
        self.restore_pending = true;
        self.valid = true;
        debug!("nested cache primed, overridden fields {:?}", overridden);
        merged
    }

    /// Compute the fields to write back into the guest hypervisor's view after a nested exit.
    ///
    /// Returns exactly the overridden fields with the guest hypervisor's own values, plus the
    /// [`NestedFieldSet::HW_WRITEBACK`] fields with the values `read_hw` reports. Must be called
    /// exactly once per nested exit.
    pub fn restore<F>(&mut self, mut read_hw: F) -> AxResult<Vec<(NestedField, u64)>>
    where
        F: FnMut(NestedField) -> AxResult<u64>,
    {
        if !self.valid {
            return ax_err!(BadState, "nested cache is not valid");
        }
        if !self.restore_pending {
            return ax_err!(BadState, "nested cache already restored for this exit");
        }

        let mut fields = Vec::with_capacity(FIELD_COUNT);
        for field in NestedField::ALL {
            if self.overridden.contains(field.bit()) {
                fields.push((field, self.inner.get(field)));
            } else if NestedFieldSet::HW_WRITEBACK.contains(field.bit()) {
                fields.push((field, read_hw(field)?));
            }
        }
        self.restore_pending = false;
        Ok(fields)
    }

    /// Arm the cache for the next nested exit after re-entering the same nested session.
    pub fn rearm(&mut self) -> AxResult {
        if !self.valid {
            return ax_err!(BadState, "nested cache is not valid");
        }
        self.restore_pending = true;
        Ok(())
    }

    /// Drop the cache: the nested session ended or nested virtualization was turned off.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.restore_pending = false;
        self.overridden = NestedFieldSet::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn inner_fields() -> NestedFields {
        NestedFields::default()
            .with(NestedField::PinControls, 0x1)
            .with(NestedField::ProcControls, 0x8000_0000)
            .with(NestedField::ExceptionBitmap, 1 << 6)
            .with(NestedField::TscOffset, 100)
            .with(NestedField::Cr0Mask, 0x1)
            .with(NestedField::EventInjection, 0x8000_0020)
    }

    fn overrides() -> NestedOverrides {
        NestedOverrides {
            pin_controls: 0x1,
            exception_bitmap: (1 << 14) | (1 << 18),
            tsc_offset: 1000,
            ..NestedOverrides::default()
        }
    }

    #[test]
    fn prime_merges_host_requirements() {
        let mut cache = NestedCache::new();
        assert!(!cache.is_valid());
        let merged = cache.prime(&inner_fields(), &overrides());
        assert!(cache.is_valid());
        assert_eq!(
            merged.get(NestedField::ExceptionBitmap),
            (1 << 6) | (1 << 14) | (1 << 18)
        );
        assert_eq!(merged.get(NestedField::TscOffset), 1100);
        // The guest hypervisor already asked for this pin control.
        assert_eq!(merged.get(NestedField::PinControls), 0x1);
        assert_eq!(
            cache.overridden(),
            NestedFieldSet::EXCEPTION_BITMAP | NestedFieldSet::TSC_OFFSET
        );
    }

    #[test]
    fn restore_returns_overridden_plus_writeback_fields() {
        let mut cache = NestedCache::new();
        cache.prime(&inner_fields(), &overrides());
        let restored = cache
            .restore(|field| match field {
                NestedField::EventInjection => Ok(0x20),
                NestedField::InterruptShadow => Ok(0x1),
                other => panic!("unexpected hardware read of {:?}", other),
            })
            .unwrap();
        assert_eq!(
            restored,
            vec![
                (NestedField::ExceptionBitmap, 1 << 6),
                (NestedField::TscOffset, 100),
                (NestedField::EventInjection, 0x20),
                (NestedField::InterruptShadow, 0x1),
            ]
        );
    }

    #[test]
    fn restore_happens_once_per_exit() {
        let mut cache = NestedCache::new();
        cache.prime(&inner_fields(), &overrides());
        cache.restore(|_| Ok(0)).unwrap();
        assert_eq!(cache.restore(|_| Ok(0)).unwrap_err(), AxError::BadState);
        cache.rearm().unwrap();
        assert!(cache.restore(|_| Ok(0)).is_ok());
    }

    #[test]
    fn invalid_cache_is_never_restored() {
        let mut cache = NestedCache::new();
        assert_eq!(cache.restore(|_| Ok(0)).unwrap_err(), AxError::BadState);
        cache.prime(&inner_fields(), &overrides());
        cache.invalidate();
        assert!(!cache.is_valid());
        assert_eq!(cache.restore(|_| Ok(0)).unwrap_err(), AxError::BadState);
        assert_eq!(cache.rearm().unwrap_err(), AxError::BadState);
    }

    #[test]
    fn failed_hardware_read_keeps_restore_pending() {
        let mut cache = NestedCache::new();
        cache.prime(&inner_fields(), &overrides());
        assert!(cache.restore(|_| ax_err!(InvalidData)).is_err());
        assert!(cache.restore(|_| Ok(0)).is_ok());
    }

    #[test]
    fn pause_filter_only_when_the_guest_hypervisor_has_none() {
        let mut cache = NestedCache::new();
        let overrides = NestedOverrides {
            pause_filter: Some((128, 4096)),
            ..NestedOverrides::default()
        };
        let merged = cache.prime(&NestedFields::default(), &overrides);
        assert_eq!(merged.get(NestedField::PleGap), 128);
        assert_eq!(merged.get(NestedField::PleWindow), 4096);
        assert!(cache.overridden().contains(
            NestedFieldSet::PROC_CONTROLS2 | NestedFieldSet::PLE_GAP | NestedFieldSet::PLE_WINDOW
        ));

        let own = NestedFields::default()
            .with(
                NestedField::ProcControls2,
                controls::PROC2_PAUSE_LOOP_EXITING,
            )
            .with(NestedField::PleGap, 10)
            .with(NestedField::PleWindow, 20);
        let merged = cache.prime(&own, &overrides);
        assert_eq!(merged.get(NestedField::PleGap), 10);
        assert!(cache.overridden().is_empty());
    }

    #[test]
    fn lbr_controls_are_stripped_without_support() {
        let mut cache = NestedCache::new();
        let inner = NestedFields::default()
            .with(NestedField::EntryControls, ENTRY_LOAD_DEBUGCTL | (1 << 9))
            .with(NestedField::ExitControls, EXIT_SAVE_DEBUGCTL);
        let merged = cache.prime(&inner, &NestedOverrides::default());
        assert_eq!(merged.get(NestedField::EntryControls), 1 << 9);
        assert_eq!(merged.get(NestedField::ExitControls), 0);

        let supported = NestedOverrides {
            lbr_virt_supported: true,
            ..NestedOverrides::default()
        };
        let merged = cache.prime(&inner, &supported);
        assert_eq!(merged, inner);
    }
}
