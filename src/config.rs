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

bitflags::bitflags! {
    /// Host CPU features and mitigation requirements relevant to the world switch.
    ///
    /// Detected once by the platform layer and handed over in [`HmConfig`]; the entry strategy
    /// is derived from it when the vcpu is created and never re-evaluated afterwards.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        /// Flush the L1 data cache before every guest entry (L1TF).
        const L1D_FLUSH_ON_ENTRY = 1 << 0;
        /// Clear CPU buffers (`VERW`) before every guest entry (MDS).
        const MDS_CLEAR_ON_ENTRY = 1 << 1;
        /// Issue an indirect branch prediction barrier before entry.
        const IBPB_ON_ENTRY = 1 << 2;
        /// Issue an indirect branch prediction barrier after exit.
        const IBPB_ON_EXIT = 1 << 3;
        /// Refill the return stack buffer after exit.
        const RSB_FILL_ON_EXIT = 1 << 4;
        /// Save/restore the guest `SPEC_CTRL` MSR around the switch.
        const SPEC_CTRL_SWAP = 1 << 5;
    }
}

/// The flavour of the virtualization extension driving the control structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// VT-x style: VMCS, VPID tags, `VMLAUNCH`/`VMRESUME`.
    Vmx,
    /// AMD-V style: VMCB, ASID tags, `VMRUN`.
    Svm,
}

/// Tunables of a hardware-assisted vcpu, passed on creation.
#[derive(Debug, Clone)]
pub struct HmConfig {
    /// Virtualization extension flavour.
    pub platform: Platform,
    /// Maximum number of immediate re-entries after benign exits before control goes
    /// back to the scheduler.
    ///
    /// This is a responsiveness/fairness knob; the default carries no protocol meaning.
    pub max_resume_loops: u32,
    /// Whether the hardware tags translation cache entries with an address-space tag.
    pub tags_supported: bool,
    /// The largest tag value the hardware accepts. Tag 0 is reserved for the host.
    pub max_tag: u32,
    /// Whether the nested guest runs with its own dedicated tag.
    pub nested_tag_dedicated: bool,
    /// Number of failed emulation attempts for one (rip, reason) pair after which the
    /// emulator is no longer consulted for it.
    pub emulation_skip_threshold: u32,
    /// Host CPU features driving the entry strategy.
    pub cpu_features: CpuFeatures,
    /// VMX-preemption timer value armed for every entry, in timer ticks. `None` leaves the
    /// timer off. Ignored on AMD-V.
    pub preemption_timer: Option<u32>,
}

impl Default for HmConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Vmx,
            max_resume_loops: 8,
            tags_supported: true,
            max_tag: 0xffff,
            nested_tag_dedicated: false,
            emulation_skip_threshold: 4,
            cpu_features: CpuFeatures::empty(),
            preemption_timer: None,
        }
    }
}
