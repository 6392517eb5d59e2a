/*
Copyright 2025 The Siglift Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The patch sequence as data.
//!
//! [`PatchPlan::build`] turns a chip profile into the ordered list of
//! remote operations, each tagged with the [`Phase`] it belongs to. The
//! plan depends only on the profile, so it can be rendered for inspection
//! without a device attached, and the executor can tell from a single
//! index whether a failure happened before or after the irreversible
//! activation write.

use std::fmt;

use crate::error::Result;
use crate::pagetable::{self, PAGE_SIZE, Pte};
use crate::profile::ChipProfile;

/// The named steps of the patch sequence, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Device present, pwned, and the supported chip; nothing modified yet.
    Precheck,
    /// Level-3 table computed locally.
    BuildTable,
    /// Table entries staged at their SRAM location, not yet referenced.
    StageTable,
    /// Original page contents duplicated into the scratch pages.
    CopyPages,
    /// Replacement instructions written into the scratch copies.
    PatchInstructions,
    /// Level-2 entry repointed at the staged table. Irreversible from
    /// software; nothing before this changed what the CPU resolves.
    ActivateTable,
    /// Data memory barrier, then full TLB invalidate.
    Synchronize,
    /// DFU abort and USB reset back to normal operation.
    Recover,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Precheck => "precheck",
            Phase::BuildTable => "build-table",
            Phase::StageTable => "stage-table",
            Phase::CopyPages => "copy-pages",
            Phase::PatchInstructions => "patch-instructions",
            Phase::ActivateTable => "activate-table",
            Phase::Synchronize => "synchronize",
            Phase::Recover => "recover",
        };
        f.write_str(name)
    }
}

/// One operation on the remote-execution channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteOp {
    /// Batched write of table entries to physical memory.
    WriteEntries { paddr: u64, entries: Vec<Pte> },
    /// 32-bit physical memory write.
    Write32 { paddr: u64, value: u32 },
    /// 64-bit physical memory write.
    Write64 { paddr: u64, value: u64 },
    /// Device-side memory copy.
    Copy { dst: u64, src: u64, len: u64 },
    /// Remote function call.
    Call { function: u64, args: Vec<u64> },
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteOp::WriteEntries { paddr, entries } => {
                write!(f, "write {} table entries at {paddr:#x}", entries.len())
            }
            RemoteOp::Write32 { paddr, value } => {
                write!(f, "write u32 {value:#010x} at {paddr:#x}")
            }
            RemoteOp::Write64 { paddr, value } => {
                write!(f, "write u64 {value:#018x} at {paddr:#x}")
            }
            RemoteOp::Copy { dst, src, len } => {
                write!(f, "copy {len:#x} bytes {src:#x} -> {dst:#x}")
            }
            RemoteOp::Call { function, args } => {
                write!(f, "call {function:#x}({args:x?})")
            }
        }
    }
}

/// A [`RemoteOp`] tagged with its phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedOp {
    /// The phase this operation belongs to.
    pub phase: Phase,
    /// The operation itself.
    pub op: RemoteOp,
}

/// The full ordered sequence of remote operations for one run.
#[derive(Clone, Debug)]
pub struct PatchPlan {
    ops: Vec<PlannedOp>,
    activation: usize,
}

impl PatchPlan {
    /// Builds the plan for `profile`.
    ///
    /// Ordering invariants: the staging write precedes the activation
    /// write, each page's copy precedes its instruction patch, and the
    /// barrier call precedes the TLB invalidate.
    pub fn build(profile: &ChipProfile) -> Result<Self> {
        profile.validate()?;

        let mut ops = Vec::new();

        // The staged table must be fully valid before anything references
        // it; a partially written table that is already live would fault
        // the walk.
        ops.push(PlannedOp {
            phase: Phase::StageTable,
            op: RemoteOp::WriteEntries {
                paddr: profile.table_staging,
                entries: pagetable::build_level3_table(profile),
            },
        });

        for r in &profile.redirects {
            ops.push(PlannedOp {
                phase: Phase::CopyPages,
                op: RemoteOp::Copy {
                    dst: r.scratch,
                    src: r.page,
                    len: PAGE_SIZE,
                },
            });
        }

        for p in &profile.patches {
            // Patches apply to the scratch copies, never the originals.
            // validate() has established the address is redirected.
            let paddr = profile.scratch_address(p).ok_or_else(|| {
                crate::error::SigliftError::InvalidProfile(format!(
                    "patch at {:#x} is not inside a redirected page",
                    p.address
                ))
            })?;
            ops.push(PlannedOp {
                phase: Phase::PatchInstructions,
                op: RemoteOp::Write32 {
                    paddr,
                    value: p.insn,
                },
            });
        }

        let activation = ops.len();
        ops.push(PlannedOp {
            phase: Phase::ActivateTable,
            op: RemoteOp::Write64 {
                paddr: profile.level2_entry,
                value: Pte::table(profile.table_staging).bits(),
            },
        });

        // Barrier first: invalidating the TLB before the table writes have
        // completed risks stale translations staying cached.
        ops.push(PlannedOp {
            phase: Phase::Synchronize,
            op: RemoteOp::Call {
                function: profile.barrier_fn,
                args: vec![profile.barrier_fn],
            },
        });
        ops.push(PlannedOp {
            phase: Phase::Synchronize,
            op: RemoteOp::Call {
                function: profile.tlb_flush_fn,
                args: vec![profile.tlb_flush_fn],
            },
        });

        Ok(PatchPlan { ops, activation })
    }

    /// The planned operations in execution order.
    pub fn ops(&self) -> &[PlannedOp] {
        &self.ops
    }

    /// Index of the activation write. A transport failure at or past this
    /// index leaves the device in an unknown state.
    pub fn activation_index(&self) -> usize {
        self.activation
    }
}
