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

/// General-purpose registers of the guest, in the order the entry stub saves them.
///
/// `RSP` is not here: it lives in the control structure.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Read a register by its instruction encoding (`RAX` = 0 ... `R15` = 15).
    ///
    /// Index 4 (`RSP`) reads as zero; use the control structure for it.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => 0,
        }
    }

    /// Write a register by its instruction encoding. Writes to index 4 are ignored.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => {}
        }
    }
}

/// Segment registers in VMCS field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
    Ldtr = 6,
    Tr = 7,
}

/// `RFLAGS.IF`.
pub const RFLAGS_IF: u64 = 1 << 9;
/// Bit 1 of `RFLAGS` is reserved and always set.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// A segment register as the control structure holds it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// VMX access-rights format.
    pub access_rights: u32,
}

impl Segment {
    const fn real_mode(selector: u16, access_rights: u32) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            access_rights,
        }
    }
}

/// `GDTR` or `IDTR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Debug registers without a control-structure field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegisters {
    /// `DR0`-`DR3`.
    pub dr: [u64; 4],
    pub dr6: u64,
}

/// Extended-state enables of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedState {
    pub xcr0: u64,
    pub xss: u64,
}

/// Guest state the control structure has no field for. The entry primitive keeps it and
/// switches it around every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwareState {
    Cr2(u64),
    Debug(DebugRegisters),
    Extended(ExtendedState),
}

/// The software copy of the guest state that the world switch exports and imports.
///
/// Whoever changes a field must mark the matching [`ContextGroups`](crate::ContextGroups)
/// dirty, otherwise the change never reaches hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestContext {
    pub gprs: GeneralRegisters,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    /// Indexed by [`SegmentReg`].
    pub segments: [Segment; 8],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub debug: DebugRegisters,
    pub xstate: ExtendedState,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub efer: u64,
    /// VT-x guest interruptibility state (`STI`/`MOV SS` blocking, NMI blocking).
    pub interruptibility: u32,
    /// Shadow structure the guest hypervisor's `VMREAD`/`VMWRITE` go to. All ones when none.
    pub vmcs_link: u64,
}

impl Default for GuestContext {
    fn default() -> Self {
        let data = Segment::real_mode(0, 0x93);
        let mut code = Segment::real_mode(0xf000, 0x9b);
        code.base = 0xffff_0000;
        Self {
            gprs: GeneralRegisters::default(),
            rip: 0xfff0,
            rsp: 0,
            rflags: RFLAGS_RESERVED,
            segments: [
                data,
                code,
                data,
                data,
                data,
                data,
                Segment::real_mode(0, 0x82),
                Segment::real_mode(0, 0x8b),
            ],
            gdtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            idtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr7: 0x400,
            debug: DebugRegisters {
                dr: [0; 4],
                dr6: 0xffff_0ff0,
            },
            xstate: ExtendedState { xcr0: 1, xss: 0 },
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pat: 0x0007_0406_0007_0406,
            efer: 0,
            interruptibility: 0,
            vmcs_link: u64::MAX,
        }
    }
}

impl GuestContext {
    /// Segment register `seg`.
    pub fn segment(&self, seg: SegmentReg) -> &Segment {
        &self.segments[seg as usize]
    }

    /// Selector of `seg`.
    pub fn selector(&self, seg: SegmentReg) -> u16 {
        self.segment(seg).selector
    }

    /// Whether a maskable interrupt can be delivered right now.
    pub fn interrupts_open(&self) -> bool {
        self.rflags & RFLAGS_IF != 0 && self.interruptibility & 0b11 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_index_skips_rsp() {
        let mut regs = GeneralRegisters::default();
        for i in 0..16u8 {
            regs.set_reg_of_index(i, 0x100 + i as u64);
        }
        assert_eq!(regs.get_reg_of_index(0), 0x100);
        assert_eq!(regs.get_reg_of_index(4), 0);
        assert_eq!(regs.r15, 0x10f);
    }

    #[test]
    fn interrupt_window_follows_if_and_shadow() {
        let mut ctx = GuestContext::default();
        assert!(!ctx.interrupts_open());
        ctx.rflags |= RFLAGS_IF;
        assert!(ctx.interrupts_open());
        ctx.interruptibility = 1; // blocking by STI
        assert!(!ctx.interrupts_open());
    }

    #[test]
    fn reset_state_is_real_mode() {
        let ctx = GuestContext::default();
        assert_eq!(ctx.selector(SegmentReg::Cs), 0xf000);
        assert_eq!(ctx.segment(SegmentReg::Cs).base, 0xffff_0000);
        assert_eq!(ctx.segment(SegmentReg::Ds).base, 0);
        assert_eq!(ctx.segment(SegmentReg::Tr).access_rights, 0x8b);
        assert_eq!(ctx.vmcs_link, u64::MAX);
    }
}
