//! Paging modes and frame arithmetic.
//!
//! ## Supported hierarchies
//!
//! - `X64` - 4-level long mode paging (48-bit virtual, 52-bit physical)
//! - `Pae` - 3-level PAE paging (32-bit virtual, 36-bit physical)
//! - `X86` - 2-level 32-bit paging (32-bit virtual, 32-bit physical)
//!
//! Large pages (2 MiB / 1 GiB, or 4 MiB under 32-bit paging) terminate a walk
//! early. The cache always works in 4 KiB frames, so large pages decompose
//! into their constituent frames.

pub mod walker;

pub use walker::{
    EntryFault, EntrySource, MappedPage, PageBacking, PageFlags, PagingWalker, Translation,
    Unresolved, WalkSummary,
};

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// log2 of the frame size.
pub const FRAME_SHIFT: u32 = 12;

/// The unit of caching and backend I/O.
pub const FRAME_SIZE: usize = 1 << FRAME_SHIFT;

const FRAME_MASK: u64 = !(FRAME_SIZE as u64 - 1);

/// Base address of the frame containing `address`.
#[inline]
pub fn frame_base(address: u64) -> u64 {
    address & FRAME_MASK
}

/// Offset of `address` inside its frame.
#[inline]
pub fn frame_offset(address: u64) -> usize {
    (address & !FRAME_MASK) as usize
}

/// Mask of bits `low_bit..=high_bit` of `value`.
#[inline]
pub(crate) fn mask(value: u64, high_bit: u32, low_bit: u32) -> u64 {
    let high_mask = if high_bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (high_bit + 1)).wrapping_sub(1)
    };
    let low_mask = if low_bit >= 64 {
        u64::MAX
    } else {
        (1u64 << low_bit).wrapping_sub(1)
    };
    value & (high_mask ^ low_mask)
}

/// Page table entry flags shared by all Intel modes.
pub(crate) const PAGE_PRESENT: u64 = 1 << 0;
pub(crate) const PAGE_WRITABLE: u64 = 1 << 1;
pub(crate) const PAGE_USER: u64 = 1 << 2;
pub(crate) const PAGE_PSE: u64 = 1 << 7;
pub(crate) const PAGE_NX: u64 = 1 << 63;

/// One level of a paging hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct Level {
    pub name: &'static str,
    /// Virtual address bits consumed by this level's index.
    pub index_bits: u32,
    /// Whether an entry at this level may map a page directly.
    pub large_page: bool,
    /// Whether the writable/user bits are architecturally defined here.
    pub access_bits: bool,
}

/// Structure: PML4 (9 bits) -> PDPT (9 bits) -> PD (9 bits) -> PT (9 bits) -> Offset (12 bits)
const X64_LEVELS: [Level; 4] = [
    Level { name: "page map level 4", index_bits: 9, large_page: false, access_bits: true },
    Level { name: "page directory pointer", index_bits: 9, large_page: true, access_bits: true },
    Level { name: "page directory", index_bits: 9, large_page: true, access_bits: true },
    Level { name: "page table", index_bits: 9, large_page: false, access_bits: true },
];

/// Structure: PDPT (2 bits) -> PD (9 bits) -> PT (9 bits) -> Offset (12 bits)
const PAE_LEVELS: [Level; 3] = [
    Level { name: "page directory pointer", index_bits: 2, large_page: false, access_bits: false },
    Level { name: "page directory", index_bits: 9, large_page: true, access_bits: true },
    Level { name: "page table", index_bits: 9, large_page: false, access_bits: true },
];

/// Structure: PD (10 bits) -> PT (10 bits) -> Offset (12 bits)
const X86_LEVELS: [Level; 2] = [
    Level { name: "page directory", index_bits: 10, large_page: true, access_bits: true },
    Level { name: "page table", index_bits: 10, large_page: false, access_bits: true },
];

/// A paging hierarchy understood by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagingMode {
    #[default]
    X64,
    Pae,
    X86,
}

impl PagingMode {
    /// Table levels from the root down.
    pub fn levels(self) -> &'static [Level] {
        match self {
            PagingMode::X64 => &X64_LEVELS,
            PagingMode::Pae => &PAE_LEVELS,
            PagingMode::X86 => &X86_LEVELS,
        }
    }

    /// Size of one table entry in bytes.
    pub fn entry_size(self) -> usize {
        match self {
            PagingMode::X64 | PagingMode::Pae => 8,
            PagingMode::X86 => 4,
        }
    }

    /// Number of implemented virtual address bits.
    pub fn virt_bits(self) -> u32 {
        match self {
            PagingMode::X64 => 48,
            PagingMode::Pae | PagingMode::X86 => 32,
        }
    }

    /// Number of physical address bits an entry can carry.
    pub fn phys_bits(self) -> u32 {
        match self {
            PagingMode::X64 => 52,
            PagingMode::Pae => 36,
            PagingMode::X86 => 32,
        }
    }

    /// Whether entries carry an execute-disable bit.
    pub fn has_nx(self) -> bool {
        !matches!(self, PagingMode::X86)
    }

    /// Physical address of the top-level table for a root register value.
    pub fn root_table(self, root: u64) -> u64 {
        match self {
            PagingMode::X64 => mask(root, 51, 12),
            // The PAE PDPT is 32-byte aligned.
            PagingMode::Pae => mask(root, 31, 5),
            PagingMode::X86 => mask(root, 31, 12),
        }
    }

    /// Lowest virtual address bit indexed by the level at `depth`.
    pub fn level_shift(self, depth: usize) -> u32 {
        let consumed: u32 = self.levels()[..=depth].iter().map(|l| l.index_bits).sum();
        self.virt_bits() - consumed
    }

    /// Strip sign extension, rejecting non-canonical addresses.
    pub fn raw_address(self, va: u64) -> Option<u64> {
        let bits = self.virt_bits();
        match self {
            PagingMode::X64 => {
                let upper = va >> (bits - 1);
                let all_ones = u64::MAX >> (bits - 1);
                if upper == 0 || upper == all_ones {
                    Some(mask(va, bits - 1, 0))
                } else {
                    None
                }
            }
            PagingMode::Pae | PagingMode::X86 => (va >> bits == 0).then_some(va),
        }
    }

    /// Re-apply sign extension to a raw walker address.
    pub fn canonical(self, raw: u64) -> u64 {
        match self {
            PagingMode::X64 if raw & (1 << 47) != 0 => raw | 0xFFFF_0000_0000_0000,
            _ => raw,
        }
    }

    /// Raw (non-sign-extended) virtual range of the user half.
    pub fn user_half(self) -> Range<u64> {
        0..1u64 << (self.virt_bits() - 1)
    }

    /// Raw virtual range of the kernel half.
    pub fn kernel_half(self) -> Range<u64> {
        1u64 << (self.virt_bits() - 1)..1u64 << self.virt_bits()
    }

    /// Whether a (canonical) virtual address lies in the user half.
    pub fn is_user_address(self, va: u64) -> bool {
        self.raw_address(va)
            .is_some_and(|raw| self.user_half().contains(&raw))
    }
}

impl std::fmt::Display for PagingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PagingMode::X64 => "x64",
            PagingMode::Pae => "pae",
            PagingMode::X86 => "x86",
        })
    }
}
