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

//! AArch64 page-table entry encoding at a 16 KiB translation granule,
//! and construction of the replacement level-3 table.
//!
//! Only the two entry kinds the patch sequence needs are modeled: level-3
//! leaf entries mapping one 16 KiB page, and the table-kind entry used to
//! repoint the level-2 slot. Callers guarantee alignment; the encoders are
//! pure and total over aligned inputs.

use std::fmt;

use crate::profile::ChipProfile;

/// The 16 KiB translation granule used by the SecureROM's tables.
pub const PAGE_SIZE: u64 = 0x4000;

/// One 64-bit descriptor in a translation table.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// Bits [1:0]: descriptor is valid, and at this level both page and
    /// table kinds use `0b11`.
    const VALID: u64 = 0b11;
    /// Bit [2]: MAIR attribute index 1.
    const ATTR_INDEX_1: u64 = 1 << 2;
    /// Bits [7:6]: AP `0b10`, read-only at EL1, no access at EL0.
    const AP_EL1_RO: u64 = 0b10 << 6;
    /// Bit [10]: access flag, pre-set so the walk never takes an
    /// access-flag fault.
    const ACCESS_FLAG: u64 = 1 << 10;

    /// Encodes a leaf entry mapping the 16 KiB page at `addr`.
    ///
    /// `addr` must be 16 KiB-aligned; misaligned bits would corrupt the
    /// low attribute fields.
    pub fn leaf(addr: u64) -> Self {
        debug_assert_eq!(addr & (PAGE_SIZE - 1), 0, "page address misaligned");
        Pte(Self::VALID
            | Self::ATTR_INDEX_1
            | Self::AP_EL1_RO
            | Self::ACCESS_FLAG
            | ((addr >> 14) << 14))
    }

    /// Encodes a table entry pointing at the next-level table at `addr`.
    ///
    /// Table descriptors carry no attribute, permission or access-flag
    /// bits, only validity and the output address.
    pub fn table(addr: u64) -> Self {
        debug_assert_eq!(addr & (PAGE_SIZE - 1), 0, "table address misaligned");
        Pte(Self::VALID | ((addr >> 14) << 14))
    }

    /// The raw descriptor value as written to device memory.
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}

impl fmt::LowerHex for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Builds the replacement level-3 table covering `profile`'s remap window.
///
/// One leaf entry per 16 KiB page, in ascending virtual-address order; the
/// remote staging write relies on positional correspondence between entry
/// index and page offset. Every page is identity-mapped except the two
/// redirected ones, which map to their scratch SRAM pages.
pub fn build_level3_table(profile: &ChipProfile) -> Vec<Pte> {
    let pages = (profile.remap_range.end - profile.remap_range.start) / PAGE_SIZE;
    let mut table = Vec::with_capacity(pages as usize);
    let mut page = profile.remap_range.start;
    while page < profile.remap_range.end {
        let target = profile.redirect_target(page).unwrap_or(page);
        table.push(Pte::leaf(target));
        page += PAGE_SIZE;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::T8015;

    #[test]
    fn leaf_entry_bit_pattern() {
        let addrs = [0u64, 0x4000, 0x1_0000_c000, 0x1_801f_8000];
        for a in addrs {
            let e = Pte::leaf(a).bits();
            assert_eq!(e & 0b11, 0b11, "valid+page bits for {a:#x}");
            assert_eq!((e >> 2) & 1, 1, "attr index for {a:#x}");
            assert_eq!((e >> 6) & 0b11, 0b10, "AP field for {a:#x}");
            assert_eq!((e >> 10) & 1, 1, "access flag for {a:#x}");
            assert_eq!((e >> 14) & 0x3_ffff_ffff, a >> 14, "output address for {a:#x}");
        }
    }

    #[test]
    fn table_entry_bit_pattern() {
        let addrs = [0u64, 0x1_8001_4000];
        for a in addrs {
            let e = Pte::table(a).bits();
            assert_eq!(e & 0b11, 0b11, "valid+table bits for {a:#x}");
            assert_eq!((e >> 2) & 1, 0, "no attr index for {a:#x}");
            assert_eq!((e >> 6) & 0b11, 0, "no AP field for {a:#x}");
            assert_eq!((e >> 10) & 1, 0, "no access flag for {a:#x}");
            assert_eq!((e >> 14) & 0x3_ffff_ffff, a >> 14, "output address for {a:#x}");
        }
    }

    #[test]
    fn known_t8015_encodings() {
        // Spot values computed by hand from the descriptor layout.
        assert_eq!(Pte::leaf(0x1_0000_0000).bits(), 0x1_0000_0487);
        assert_eq!(Pte::table(0x1_8001_4000).bits(), 0x1_8001_4003);
    }

    #[test]
    fn level3_table_covers_rom_window() {
        let table = build_level3_table(&T8015);
        assert_eq!(table.len(), 64);

        for (i, entry) in table.iter().enumerate() {
            let page = 0x1_0000_0000u64 + i as u64 * PAGE_SIZE;
            let expected = match page {
                0x1_0000_c000 => Pte::leaf(0x1_801f_8000),
                0x1_0000_4000 => Pte::leaf(0x1_801f_4000),
                identity => Pte::leaf(identity),
            };
            assert_eq!(*entry, expected, "entry {i} for page {page:#x}");
        }
    }

    #[test]
    fn level3_table_redirects_exactly_two_pages() {
        let table = build_level3_table(&T8015);
        let redirected: Vec<usize> = table
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                let identity = 0x1_0000_0000u64 + *i as u64 * PAGE_SIZE;
                **e != Pte::leaf(identity)
            })
            .map(|(i, _)| i)
            .collect();
        // 0x1_0000_4000 is entry 1, 0x1_0000_c000 is entry 3.
        assert_eq!(redirected, vec![1, 3]);
    }
}
