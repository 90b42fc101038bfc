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

use alloc::vec::Vec;

use axerrno::AxResult;

use crate::arch_vcpu::AxArchVCpu;
use crate::config::CpuFeatures;
use crate::regs::GeneralRegisters;
use crate::vmcs::StructureKind;

/// One side-channel mitigation performed around the guest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitigationStep {
    /// Load the guest `SPEC_CTRL` value.
    LoadGuestSpecCtrl,
    /// Restore the host `SPEC_CTRL` value.
    LoadHostSpecCtrl,
    /// Indirect branch prediction barrier.
    Ibpb,
    /// Flush the L1 data cache.
    FlushL1d,
    /// Overwrite CPU buffers with `VERW`.
    ClearCpuBuffers,
    /// Stuff the return stack buffer.
    FillRsb,
}

/// The world-switch entry strategy of a vcpu.
///
/// Rather than one entry routine per combination of mitigations, the required steps are
/// chosen once from the host features and applied, in order, around the single
/// [`AxArchVCpu::enter_guest`] primitive. The cost is one indirect call per step.
#[derive(Debug, Clone)]
pub struct EntryStrategy {
    pre_entry: Vec<MitigationStep>,
    post_exit: Vec<MitigationStep>,
}

impl EntryStrategy {
    /// Select the steps required by `features`.
    pub fn new(features: CpuFeatures) -> Self {
        let mut pre_entry = Vec::new();
        let mut post_exit = Vec::new();

        if features.contains(CpuFeatures::SPEC_CTRL_SWAP) {
            pre_entry.push(MitigationStep::LoadGuestSpecCtrl);
        }
        if features.contains(CpuFeatures::IBPB_ON_ENTRY) {
            pre_entry.push(MitigationStep::Ibpb);
        }
        // The L1D flush also clears the CPU buffers, one of them is enough.
        if features.contains(CpuFeatures::L1D_FLUSH_ON_ENTRY) {
            pre_entry.push(MitigationStep::FlushL1d);
        } else if features.contains(CpuFeatures::MDS_CLEAR_ON_ENTRY) {
            pre_entry.push(MitigationStep::ClearCpuBuffers);
        }

        if features.contains(CpuFeatures::SPEC_CTRL_SWAP) {
            post_exit.push(MitigationStep::LoadHostSpecCtrl);
        }
        if features.contains(CpuFeatures::RSB_FILL_ON_EXIT) {
            post_exit.push(MitigationStep::FillRsb);
        }
        if features.contains(CpuFeatures::IBPB_ON_EXIT) {
            post_exit.push(MitigationStep::Ibpb);
        }

        debug!(
            "entry strategy: pre-entry {:?}, post-exit {:?}",
            pre_entry, post_exit
        );
        Self {
            pre_entry,
            post_exit,
        }
    }

    /// Steps executed right before entering the guest.
    pub fn pre_entry(&self) -> &[MitigationStep] {
        &self.pre_entry
    }

    /// Steps executed right after the guest exited.
    pub fn post_exit(&self) -> &[MitigationStep] {
        &self.post_exit
    }

    /// Enter the guest with all mitigations applied.
    ///
    /// Runs inside the non-preemptible section: no allocation happens here. The post-exit steps
    /// run whether or not the entry succeeded.
    pub fn enter<A: AxArchVCpu>(
        &self,
        arch: &mut A,
        structure: StructureKind,
        launch: bool,
        regs: &mut GeneralRegisters,
    ) -> AxResult<u32> {
        for &step in &self.pre_entry {
            arch.apply_mitigation(step);
        }
        let result = arch.enter_guest(structure, launch, regs);
        for &step in &self.post_exit {
            arch.apply_mitigation(step);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_features_no_steps() {
        let strategy = EntryStrategy::new(CpuFeatures::empty());
        assert!(strategy.pre_entry().is_empty());
        assert!(strategy.post_exit().is_empty());
    }

    #[test]
    fn steps_are_ordered_and_deduplicated() {
        let strategy = EntryStrategy::new(CpuFeatures::all());
        assert_eq!(
            strategy.pre_entry(),
            &[
                MitigationStep::LoadGuestSpecCtrl,
                MitigationStep::Ibpb,
                MitigationStep::FlushL1d
            ]
        );
        assert_eq!(
            strategy.post_exit(),
            &[
                MitigationStep::LoadHostSpecCtrl,
                MitigationStep::FillRsb,
                MitigationStep::Ibpb
            ]
        );

        let mds_only = EntryStrategy::new(CpuFeatures::MDS_CLEAR_ON_ENTRY);
        assert_eq!(mds_only.pre_entry(), &[MitigationStep::ClearCpuBuffers]);
    }
}
