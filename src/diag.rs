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

//! Read-only diagnostics: exit counters and the state captured on fatal errors.

use core::fmt;

use crate::vmcs::ControlSnapshot;

/// Number of basic exit reasons counted individually; larger reasons share the last slot.
pub const EXIT_REASON_SLOTS: usize = 72;

/// Per-exit-reason counters of one vcpu.
#[derive(Debug, Clone)]
pub struct ExitStats {
    by_reason: [u64; EXIT_REASON_SLOTS],
    total: u64,
    resumed: u64,
    entry_failures: u64,
}

impl Default for ExitStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitStats {
    pub const fn new() -> Self {
        Self {
            by_reason: [0; EXIT_REASON_SLOTS],
            total: 0,
            resumed: 0,
            entry_failures: 0,
        }
    }

    pub(crate) fn count_exit(&mut self, basic_reason: u32) {
        let slot = (basic_reason as usize).min(EXIT_REASON_SLOTS - 1);
        self.by_reason[slot] += 1;
        self.total += 1;
    }

    pub(crate) fn count_resume(&mut self) {
        self.resumed += 1;
    }

    pub(crate) fn count_entry_failure(&mut self) {
        self.entry_failures += 1;
    }

    /// Exits with basic reason `basic_reason`.
    pub fn exits(&self, basic_reason: u32) -> u64 {
        self.by_reason
            .get(basic_reason as usize)
            .copied()
            .unwrap_or_default()
    }

    /// All exits.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Exits followed by an immediate re-entry without going back to the scheduler.
    pub fn resumed(&self) -> u64 {
        self.resumed
    }

    pub fn entry_failures(&self) -> u64 {
        self.entry_failures
    }

    /// `(basic reason, count)` for every reason seen at least once.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.by_reason
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(reason, count)| (reason as u32, *count))
    }
}

/// What went fatally wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// The processor refused the entry (exit reason bit 31 set).
    EntryFailed { qualification: u64 },
    /// The entry instruction failed with the given VM-instruction error.
    EntryInstruction { error: u64 },
    /// A cached control field did not read back as written.
    ReadbackMismatch,
    /// Preemption was disabled again without the previous disable being restored.
    UnbalancedPreemption { depth: u32 },
    /// Another vcpu already owned the physical CPU.
    CpuAlreadyClaimed,
}

/// State captured when a vcpu stops because of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalDump {
    pub reason: FatalReason,
    /// Raw exit reason of the last exit, `None` if the vcpu never exited.
    pub last_exit_reason: Option<u32>,
    pub phys_cpu: Option<usize>,
    pub controls: ControlSnapshot,
}

impl fmt::Display for FatalDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on pCPU ", self.reason)?;
        match self.phys_cpu {
            Some(cpu) => write!(f, "{}", cpu)?,
            None => f.write_str("?")?,
        }
        if let Some(raw) = self.last_exit_reason {
            write!(f, ", last exit {:#x}", raw)?;
        }
        write!(
            f,
            ", {:?} structure {:?}",
            self.controls.kind, self.controls.launch_state
        )?;
        for (index, value) in self.controls.values.iter().enumerate() {
            if let Some(value) = value {
                write!(f, ", control[{}]={:#x}", index, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcs::{ControlStructureInfo, StructureKind, TagFlushMode};

    #[test]
    fn counters() {
        let mut stats = ExitStats::new();
        stats.count_exit(1);
        stats.count_exit(1);
        stats.count_exit(12);
        stats.count_exit(0x1234);
        stats.count_resume();
        assert_eq!(stats.exits(1), 2);
        assert_eq!(stats.exits(12), 1);
        assert_eq!(stats.exits(EXIT_REASON_SLOTS as u32 - 1), 1);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.resumed(), 1);
        assert_eq!(stats.iter().count(), 3);
    }

    #[test]
    fn dump_display() {
        let dump = FatalDump {
            reason: FatalReason::ReadbackMismatch,
            last_exit_reason: Some(0x8000_0021),
            phys_cpu: Some(3),
            controls: ControlStructureInfo::new(StructureKind::Outer, TagFlushMode::SingleContext)
                .snapshot(),
        };
        let text = format!("{}", dump);
        assert!(text.starts_with("ReadbackMismatch on pCPU 3"));
        assert!(text.contains("last exit 0x80000021"));
    }
}
