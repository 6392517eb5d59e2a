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

//! Per-chip address catalog.
//!
//! Every address in a [`ChipProfile`] is specific to one chip revision and
//! one SecureROM build; nothing here is derived. Supporting another chip
//! is a matter of adding a profile, not editing the sequencing logic.

use std::ops::Range;

use crate::error::{Result, SigliftError};
use crate::pagetable::PAGE_SIZE;

/// A firmware page diverted into writable SRAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRedirect {
    /// Virtual address of the original ROM page.
    pub page: u64,
    /// Physical SRAM page the copy lives in.
    pub scratch: u64,
}

/// One 4-byte instruction overwrite inside a redirected page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionPatch {
    /// Address of the instruction in the original ROM mapping.
    pub address: u64,
    /// Replacement AArch64 instruction, written little-endian.
    pub insn: u32,
}

/// The complete set of fixed addresses for one chip revision.
#[derive(Clone, Debug)]
pub struct ChipProfile {
    /// Human-readable chip name.
    pub name: &'static str,
    /// Substring of the DFU serial string identifying the chip.
    pub chip_id: &'static str,
    /// Virtual range the replacement level-3 table covers, one leaf entry
    /// per 16 KiB page.
    pub remap_range: Range<u64>,
    /// Physical SRAM page the level-3 table is staged at.
    pub table_staging: u64,
    /// Physical address of the level-2 entry repointed at the staged table.
    pub level2_entry: u64,
    /// The pages diverted into SRAM.
    pub redirects: [PageRedirect; 2],
    /// The instruction overwrites applied to the SRAM copies.
    pub patches: [InstructionPatch; 2],
    /// ROM helper performing a data memory barrier, called with its own
    /// address as the single argument.
    pub barrier_fn: u64,
    /// ROM helper performing a full TLB invalidate, same convention.
    pub tlb_flush_fn: u64,
}

/// t8015 (A11) SecureROM.
pub const T8015: ChipProfile = ChipProfile {
    name: "t8015",
    chip_id: "CPID:8015",
    remap_range: 0x1_0000_0000..0x1_0010_0000,
    table_staging: 0x1_8001_4000,
    level2_entry: 0x1_8000_c400,
    redirects: [
        // heap_add_chunk integrity check
        PageRedirect {
            page: 0x1_0000_c000,
            scratch: 0x1_801f_8000,
        },
        // image4 signature validation
        PageRedirect {
            page: 0x1_0000_4000,
            scratch: 0x1_801f_4000,
        },
    ],
    patches: [
        // Heap-corruption abort becomes an early RET.
        InstructionPatch {
            address: 0x1_0000_db98,
            insn: 0xd65f_03c0,
        },
        // Signature-verification result forced to zero: MOV X0, #0.
        InstructionPatch {
            address: 0x1_0000_624c,
            insn: 0xd280_0000,
        },
    ],
    barrier_fn: 0x1_0000_04f0,
    tlb_flush_fn: 0x1_0000_04ac,
};

impl ChipProfile {
    /// Whether the device's serial string identifies this chip.
    pub fn matches_serial(&self, serial: &str) -> bool {
        serial.contains(self.chip_id)
    }

    /// The scratch page a redirected virtual page maps to, if any.
    pub fn redirect_target(&self, page: u64) -> Option<u64> {
        self.redirects
            .iter()
            .find(|r| r.page == page)
            .map(|r| r.scratch)
    }

    /// Translates a patch address from the original ROM mapping into the
    /// scratch copy it must actually be applied to.
    pub fn scratch_address(&self, patch: &InstructionPatch) -> Option<u64> {
        self.redirects
            .iter()
            .find(|r| (r.page..r.page + PAGE_SIZE).contains(&patch.address))
            .map(|r| patch.address - r.page + r.scratch)
    }

    /// Checks the profile's internal consistency before any of it is sent
    /// to a device.
    pub fn validate(&self) -> Result<()> {
        let aligned = |addr: u64| addr & (PAGE_SIZE - 1) == 0;

        if !aligned(self.remap_range.start)
            || !aligned(self.remap_range.end)
            || self.remap_range.is_empty()
        {
            return Err(SigliftError::InvalidProfile(format!(
                "remap range {:#x}..{:#x} is not a page-aligned window",
                self.remap_range.start, self.remap_range.end
            )));
        }
        if !aligned(self.table_staging) {
            return Err(SigliftError::InvalidProfile(format!(
                "staging address {:#x} misaligned",
                self.table_staging
            )));
        }
        for r in &self.redirects {
            if !aligned(r.page) || !aligned(r.scratch) {
                return Err(SigliftError::InvalidProfile(format!(
                    "redirect {:#x} -> {:#x} misaligned",
                    r.page, r.scratch
                )));
            }
            if !self.remap_range.contains(&r.page) {
                return Err(SigliftError::InvalidProfile(format!(
                    "redirected page {:#x} outside remap range",
                    r.page
                )));
            }
        }
        for p in &self.patches {
            // The scratch-relative offset must land strictly inside one
            // 16 KiB page, including all four instruction bytes.
            match self.scratch_address(p) {
                Some(scratch) => {
                    let offset = scratch & (PAGE_SIZE - 1);
                    if offset + 4 > PAGE_SIZE {
                        return Err(SigliftError::InvalidProfile(format!(
                            "patch at {:#x} straddles a page boundary",
                            p.address
                        )));
                    }
                }
                None => {
                    return Err(SigliftError::InvalidProfile(format!(
                        "patch at {:#x} is not inside a redirected page",
                        p.address
                    )));
                }
            }
        }
        Ok(())
    }
}
