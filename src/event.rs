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

use alloc::collections::VecDeque;

use bit_field::BitField;

use axerrno::{AxResult, ax_err};

use crate::addr::GuestVirtAddr;

/// Architectural exception vectors used by the merge rules.
pub mod vector {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const DEBUG: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BREAKPOINT: u8 = 3;
    pub const OVERFLOW: u8 = 4;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const INVALID_TSS: u8 = 10;
    pub const SEGMENT_NOT_PRESENT: u8 = 11;
    pub const STACK_FAULT: u8 = 12;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
    pub const ALIGNMENT_CHECK: u8 = 17;
    pub const MACHINE_CHECK: u8 = 18;
}

/// The kind of an injected event, numbered as the VT-x interruption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// Maskable external interrupt.
    ExternalInterrupt = 0,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception (fault or trap).
    HardwareException = 3,
    /// `INT n`.
    SoftwareInterrupt = 4,
    /// `INT1` (ICEBP).
    PrivilegedSoftwareException = 5,
    /// `INT3` or `INTO`.
    SoftwareException = 6,
}

impl EventKind {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::ExternalInterrupt,
            2 => Self::Nmi,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => return None,
        })
    }

    /// Whether the event is delivered as the result of an instruction and needs its length.
    pub const fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

/// An interrupt or exception waiting to be injected into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub vector: u8,
    /// Error code pushed on the guest stack, if the vector has one.
    pub error_code: Option<u32>,
    /// Length of the instruction that raised a software event.
    pub instr_len: Option<u8>,
    /// Faulting linear address, page faults only. Becomes the guest `CR2`.
    pub fault_addr: Option<GuestVirtAddr>,
}

/// Exception classes of the double-fault rules (SDM Vol. 3A, Table 6-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl PendingEvent {
    /// A maskable external interrupt.
    pub const fn interrupt(vector: u8) -> Self {
        Self::new(EventKind::ExternalInterrupt, vector)
    }

    /// A non-maskable interrupt.
    pub const fn nmi() -> Self {
        Self::new(EventKind::Nmi, vector::NMI)
    }

    /// A hardware exception, with the error code if the vector defines one.
    pub const fn exception(vector: u8, error_code: Option<u32>) -> Self {
        let mut event = Self::new(EventKind::HardwareException, vector);
        event.error_code = error_code;
        event
    }

    /// A page fault at `addr`.
    pub const fn page_fault(error_code: u32, addr: GuestVirtAddr) -> Self {
        let mut event = Self::exception(vector::PAGE_FAULT, Some(error_code));
        event.fault_addr = Some(addr);
        event
    }

    /// A software interrupt or software exception raised by an instruction of `instr_len` bytes.
    pub const fn software(kind: EventKind, vector: u8, instr_len: u8) -> Self {
        let mut event = Self::new(kind, vector);
        event.instr_len = Some(instr_len);
        event
    }

    const fn new(kind: EventKind, vector: u8) -> Self {
        Self {
            kind,
            vector,
            error_code: None,
            instr_len: None,
            fault_addr: None,
        }
    }

    fn class(&self) -> ExceptionClass {
        use vector::*;
        if self.kind != EventKind::HardwareException {
            return ExceptionClass::Benign;
        }
        match self.vector {
            DIVIDE_ERROR | INVALID_TSS | SEGMENT_NOT_PRESENT | STACK_FAULT | GENERAL_PROTECTION => {
                ExceptionClass::Contributory
            }
            PAGE_FAULT => ExceptionClass::PageFault,
            DOUBLE_FAULT => ExceptionClass::DoubleFault,
            _ => ExceptionClass::Benign,
        }
    }

    /// Encode in the VT-x VM-entry interruption-information format (SDM Vol. 3C, 24.8.3).
    pub fn encode(&self) -> u32 {
        let mut info = 0u32;
        info.set_bits(0..8, self.vector as u32);
        info.set_bits(8..11, self.kind as u32);
        info.set_bit(11, self.error_code.is_some());
        info.set_bit(31, true);
        info
    }

    /// Decode IDT-vectoring information saved by the processor on an exit that interrupted
    /// the delivery of an event.
    ///
    /// Returns `None` if no event was being delivered.
    pub fn from_idt_vectoring(info: u32, error_code: u32, instr_len: u32) -> Option<Self> {
        if !info.get_bit(31) {
            return None;
        }
        let kind = EventKind::from_raw(info.get_bits(8..11))?;
        let mut event = Self::new(kind, info.get_bits(0..8) as u8);
        if info.get_bit(11) {
            event.error_code = Some(error_code);
        }
        if kind.is_software() {
            event.instr_len = Some(instr_len as u8);
        }
        Some(event)
    }
}

/// Result of a successful [`EventInjector::set_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPendingOutcome {
    /// The event is now pending.
    Queued,
    /// The new exception combined with the pending one into a double fault.
    MergedIntoDoubleFault,
    /// An exception during double-fault delivery: the guest must be shut down.
    /// Nothing is pending anymore.
    Shutdown,
}

/// Holds at most one requested event per vcpu and decides when it can be delivered.
///
/// Events whose delivery an exit cut short are kept apart from the requested one and always
/// go first: hardware had already started delivering them.
#[derive(Debug, Default)]
pub struct EventInjector {
    reinjected: VecDeque<PendingEvent>,
    pending: Option<PendingEvent>,
    window_wanted: bool,
}

impl EventInjector {
    /// Create an empty injector.
    pub const fn new() -> Self {
        Self {
            reinjected: VecDeque::new(),
            pending: None,
            window_wanted: false,
        }
    }

    /// The event the next entry delivers, if any.
    pub fn pending(&self) -> Option<&PendingEvent> {
        self.reinjected.front().or(self.pending.as_ref())
    }

    /// The requested event, not counting interrupted deliveries.
    pub fn requested(&self) -> Option<&PendingEvent> {
        self.pending.as_ref()
    }

    /// Number of events waiting, interrupted deliveries included.
    pub fn len(&self) -> usize {
        self.reinjected.len() + self.pending.is_some() as usize
    }

    /// Whether nothing waits for injection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `event` for injection.
    ///
    /// Fails with `ResourceBusy` (already pending) if a different event is queued and the two
    /// do not merge under the double-fault rules. A rejected external interrupt asks for an
    /// interrupt-window exit so the requester gets another chance once the slot is free.
    pub fn set_pending(&mut self, event: PendingEvent) -> AxResult<SetPendingOutcome> {
        let Some(current) = self.pending else {
            self.pending = Some(event);
            return Ok(SetPendingOutcome::Queued);
        };
        if current == event {
            return Ok(SetPendingOutcome::Queued);
        }

        use ExceptionClass::*;
        match (current.class(), event.class()) {
            (DoubleFault, Contributory | PageFault) => {
                warn!(
                    "exception {:#x} while delivering a double fault, shutting down",
                    event.vector
                );
                self.pending = None;
                Ok(SetPendingOutcome::Shutdown)
            }
            (Contributory, Contributory) | (PageFault, Contributory | PageFault) => {
                debug!(
                    "exception {:#x} after {:#x} merged into a double fault",
                    event.vector, current.vector
                );
                self.pending = Some(PendingEvent::exception(vector::DOUBLE_FAULT, Some(0)));
                Ok(SetPendingOutcome::MergedIntoDoubleFault)
            }
            _ => {
                if event.kind == EventKind::ExternalInterrupt {
                    self.window_wanted = true;
                }
                ax_err!(ResourceBusy, "an event is already pending")
            }
        }
    }

    /// Take the next event for the upcoming entry.
    ///
    /// External interrupts stay queued while `interrupts_open` is false; an interrupt-window
    /// exit is requested instead. Nothing behind them is delivered out of order.
    pub fn consume(&mut self, interrupts_open: bool) -> Option<PendingEvent> {
        let event = *self.pending()?;
        if event.kind == EventKind::ExternalInterrupt && !interrupts_open {
            self.window_wanted = true;
            return None;
        }
        if self.reinjected.pop_front().is_none() {
            self.pending = None;
        }
        Some(event)
    }

    /// Put back an event that was consumed but not delivered because the entry was cut short.
    ///
    /// The event goes ahead of everything else, including a request queued since.
    pub fn reinject(&mut self, event: PendingEvent) {
        if let Some(next) = self.pending() {
            trace!(
                "re-injected vector {:#x} goes ahead of vector {:#x}",
                event.vector,
                next.vector
            );
        }
        self.reinjected.push_front(event);
    }

    /// Whether an interrupt-window exit has been requested.
    pub fn interrupt_window_wanted(&self) -> bool {
        self.window_wanted
    }

    /// Acknowledge the interrupt-window request after it has been armed (or served).
    pub fn clear_window_request(&mut self) {
        self.window_wanted = false;
    }

    /// Drop everything. Used on reset.
    pub fn clear(&mut self) {
        self.reinjected.clear();
        self.pending = None;
        self.window_wanted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::vector::*;
    use super::*;
    use axerrno::AxError;

    #[test]
    fn page_fault_then_gp_becomes_double_fault() {
        let mut injector = EventInjector::new();
        let pf = PendingEvent::page_fault(0x2, GuestVirtAddr::from_usize(0xdead_b000));
        assert_eq!(injector.set_pending(pf), Ok(SetPendingOutcome::Queued));
        assert_eq!(
            injector.set_pending(PendingEvent::exception(GENERAL_PROTECTION, Some(0))),
            Ok(SetPendingOutcome::MergedIntoDoubleFault)
        );
        let pending = injector.pending().unwrap();
        assert_eq!(pending.vector, DOUBLE_FAULT);
        assert_eq!(pending.kind, EventKind::HardwareException);
        assert_eq!(pending.error_code, Some(0));
    }

    #[test]
    fn contributory_pairs_merge_and_benign_ones_do_not() {
        let mut injector = EventInjector::new();
        injector
            .set_pending(PendingEvent::exception(DIVIDE_ERROR, None))
            .unwrap();
        assert_eq!(
            injector.set_pending(PendingEvent::exception(INVALID_TSS, Some(8))),
            Ok(SetPendingOutcome::MergedIntoDoubleFault)
        );

        // #GP then #PF is handled serially, not merged.
        let mut injector = EventInjector::new();
        injector
            .set_pending(PendingEvent::exception(GENERAL_PROTECTION, Some(0)))
            .unwrap();
        assert_eq!(
            injector.set_pending(PendingEvent::page_fault(0, GuestVirtAddr::from_usize(0))),
            Err(AxError::ResourceBusy)
        );
        assert_eq!(injector.pending().unwrap().vector, GENERAL_PROTECTION);

        let mut injector = EventInjector::new();
        injector
            .set_pending(PendingEvent::exception(INVALID_OPCODE, None))
            .unwrap();
        assert_eq!(
            injector.set_pending(PendingEvent::exception(GENERAL_PROTECTION, Some(0))),
            Err(AxError::ResourceBusy)
        );
    }

    #[test]
    fn fault_during_double_fault_shuts_down() {
        let mut injector = EventInjector::new();
        injector
            .set_pending(PendingEvent::exception(DOUBLE_FAULT, Some(0)))
            .unwrap();
        assert_eq!(
            injector.set_pending(PendingEvent::exception(STACK_FAULT, Some(0))),
            Ok(SetPendingOutcome::Shutdown)
        );
        assert!(injector.pending().is_none());
    }

    #[test]
    fn identical_request_is_idempotent() {
        let mut injector = EventInjector::new();
        let irq = PendingEvent::interrupt(0x30);
        injector.set_pending(irq).unwrap();
        assert_eq!(injector.set_pending(irq), Ok(SetPendingOutcome::Queued));
        assert_eq!(injector.pending(), Some(&irq));
    }

    #[test]
    fn second_interrupt_is_rejected_and_arms_the_window() {
        let mut injector = EventInjector::new();
        injector.set_pending(PendingEvent::interrupt(0x30)).unwrap();
        assert_eq!(
            injector.set_pending(PendingEvent::interrupt(0x31)),
            Err(AxError::ResourceBusy)
        );
        assert!(injector.interrupt_window_wanted());
        assert_eq!(injector.pending().unwrap().vector, 0x30);
    }

    #[test]
    fn masked_interrupt_stays_pending() {
        let mut injector = EventInjector::new();
        injector.set_pending(PendingEvent::interrupt(0x40)).unwrap();
        assert_eq!(injector.consume(false), None);
        assert!(injector.interrupt_window_wanted());
        injector.clear_window_request();
        assert_eq!(injector.consume(true).unwrap().vector, 0x40);
        assert!(injector.pending().is_none());
    }

    #[test]
    fn exceptions_ignore_the_interrupt_window() {
        let mut injector = EventInjector::new();
        injector
            .set_pending(PendingEvent::exception(INVALID_OPCODE, None))
            .unwrap();
        assert_eq!(injector.consume(false).unwrap().vector, INVALID_OPCODE);
        assert!(!injector.interrupt_window_wanted());
    }

    #[test]
    fn reinject_takes_priority_over_newer_events() {
        let mut injector = EventInjector::new();
        let old = PendingEvent::exception(GENERAL_PROTECTION, Some(0x10));
        injector.set_pending(old).unwrap();
        let consumed = injector.consume(true).unwrap();
        let newer = PendingEvent::interrupt(0x50);
        injector.set_pending(newer).unwrap();
        injector.reinject(consumed);
        assert_eq!(injector.pending(), Some(&old));
        assert_eq!(injector.requested(), Some(&newer));
        assert_eq!(injector.len(), 2);

        assert_eq!(injector.consume(true), Some(old));
        assert_eq!(injector.consume(true), Some(newer));
        assert!(injector.is_empty());
    }

    #[test]
    fn interrupted_delivery_never_displaces_a_held_interrupt() {
        let mut injector = EventInjector::new();
        let irq = PendingEvent::interrupt(0x30);
        injector.set_pending(irq).unwrap();
        assert_eq!(injector.consume(false), None);

        // The guest's own page fault was cut short while the interrupt waited for IF.
        let pf = PendingEvent::exception(PAGE_FAULT, Some(2));
        injector.reinject(pf);
        assert_eq!(injector.consume(false), Some(pf));
        assert_eq!(injector.consume(false), None);
        assert_eq!(injector.consume(true), Some(irq));
        assert!(injector.is_empty());
    }

    #[test]
    fn held_interrupt_in_front_blocks_the_queue() {
        let mut injector = EventInjector::new();
        injector.reinject(PendingEvent::interrupt(0x31));
        injector
            .set_pending(PendingEvent::exception(INVALID_OPCODE, None))
            .unwrap();
        assert_eq!(injector.consume(false), None);
        assert!(injector.interrupt_window_wanted());
        assert_eq!(injector.consume(true).unwrap().vector, 0x31);
        assert_eq!(injector.consume(false).unwrap().vector, INVALID_OPCODE);
        injector.reinject(PendingEvent::nmi());
        injector.clear();
        assert!(injector.is_empty());
    }

    #[test]
    fn encoding_matches_the_interruption_information_layout() {
        let gp = PendingEvent::exception(GENERAL_PROTECTION, Some(0));
        assert_eq!(gp.encode(), 0x8000_0b0d);
        assert_eq!(PendingEvent::interrupt(0x20).encode(), 0x8000_0020);
        let int3 = PendingEvent::software(EventKind::SoftwareException, BREAKPOINT, 1);
        assert_eq!(int3.encode(), 0x8000_0603);
        assert_eq!(
            PendingEvent::from_idt_vectoring(int3.encode(), 0, 1),
            Some(int3)
        );
        assert_eq!(PendingEvent::from_idt_vectoring(0x0000_0b0d, 0, 0), None);
    }
}
