//! Page table walking.
//!
//! A table-driven walker over the hierarchies described by [`PagingMode`].
//! Table entries are fetched through an [`EntrySource`], which the engine
//! backs with the page cache so that table reads share frames with data reads.

use super::{mask, PagingMode, FRAME_SHIFT, PAGE_NX, PAGE_PRESENT, PAGE_PSE, PAGE_USER, PAGE_WRITABLE};
use crate::error::{Error, FailureReason};
use serde::Serialize;
use std::ops::Range;

/// Why a table entry could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFault {
    /// The backend returned fewer bytes than the entry needs.
    ShortRead,
    /// The entry lies beyond the physical address space.
    OutOfBounds,
    /// The backend timed out.
    Timeout,
    /// The backend is gone.
    Unavailable,
}

/// Supplies paging-structure entries by physical address.
pub trait EntrySource {
    /// Read a little-endian entry of `width` bytes (4 or 8).
    fn read_entry(&self, address: u64, width: usize) -> Result<u64, EntryFault>;

    /// Read `count` consecutive entries starting at `address`.
    fn read_table(&self, address: u64, count: usize, width: usize) -> Result<Vec<u64>, EntryFault> {
        (0..count)
            .map(|i| self.read_entry(address + (i * width) as u64, width))
            .collect()
    }
}

/// A virtual address that could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    /// An entry on the path is not present. Definitive.
    NotMapped { level: &'static str, entry: u64 },
    /// An entry on the path could not be read. Transient.
    BackendFailure {
        level: &'static str,
        entry_address: u64,
        timed_out: bool,
    },
    /// The virtual address is non-canonical, or a table or the final
    /// physical address lies outside the physical address space.
    OutOfBounds { address: u64 },
    /// The backend went away during the walk.
    BackendUnavailable,
}

impl Unresolved {
    /// Item-level classification.
    pub fn reason(self) -> FailureReason {
        match self {
            Unresolved::NotMapped { .. } => FailureReason::NotMapped,
            Unresolved::BackendFailure { timed_out: true, .. } => FailureReason::Timeout,
            Unresolved::BackendFailure { .. } => FailureReason::BackendFailure,
            Unresolved::OutOfBounds { .. } => FailureReason::OutOfBounds,
            Unresolved::BackendUnavailable => FailureReason::BackendUnavailable,
        }
    }

    /// Whether another walk could succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Unresolved::BackendFailure { .. })
    }

    /// Convert into an engine error for the virtual address `va`.
    pub fn into_error(self, va: u64, backend: &str) -> Error {
        match self {
            Unresolved::NotMapped { level, entry } => Error::TranslationNotMapped {
                address: va,
                level,
                entry,
            },
            Unresolved::BackendFailure {
                level,
                entry_address,
                ..
            } => Error::TranslationBackendFailure {
                address: va,
                level,
                entry_address,
            },
            Unresolved::OutOfBounds { address } => {
                Error::out_of_bounds(address, format!("while translating {:#x}", va))
            }
            Unresolved::BackendUnavailable => {
                Error::backend_unavailable(backend, "lost during page table walk")
            }
        }
    }
}

/// Effective access rights of a mapping, combined across all levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub no_execute: bool,
}

impl PageFlags {
    const fn permissive() -> Self {
        PageFlags {
            writable: true,
            user: true,
            no_execute: false,
        }
    }

    /// Restrict by one more entry on the path.
    fn descend(self, entry: u64, mode: PagingMode, access_bits: bool) -> Self {
        PageFlags {
            writable: self.writable && (!access_bits || entry & PAGE_WRITABLE != 0),
            user: self.user && (!access_bits || entry & PAGE_USER != 0),
            no_execute: self.no_execute || (mode.has_nx() && entry & PAGE_NX != 0),
        }
    }
}

/// Granularity of the leaf entry that mapped a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageBacking {
    /// 4 KiB page table entry.
    Small,
    /// 2 MiB (4 MiB under 32-bit paging) directory entry.
    Large,
    /// 1 GiB directory pointer entry.
    Huge,
}

impl PageBacking {
    fn from_shift(shift: u32) -> Self {
        match shift {
            s if s <= FRAME_SHIFT => PageBacking::Small,
            s if s < 30 => PageBacking::Large,
            _ => PageBacking::Huge,
        }
    }
}

/// A successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub physical_address: u64,
    /// log2 of the size of the page that maps the address.
    pub page_shift: u32,
    pub flags: PageFlags,
}

impl Translation {
    /// Size of the mapping page in bytes.
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_shift
    }

    pub fn backing(&self) -> PageBacking {
        PageBacking::from_shift(self.page_shift)
    }

    /// The same mapping, shifted by `delta` bytes within the page.
    pub(crate) fn offset_by(self, delta: u64) -> Self {
        Translation {
            physical_address: self.physical_address + delta,
            ..self
        }
    }
}

/// A present leaf entry found by [`PagingWalker::walk_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPage {
    /// Canonical virtual address of the page.
    pub va: u64,
    pub physical_address: u64,
    pub page_shift: u32,
    pub flags: PageFlags,
}

impl MappedPage {
    pub fn backing(&self) -> PageBacking {
        PageBacking::from_shift(self.page_shift)
    }
}

/// Bookkeeping from a full-hierarchy walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkSummary {
    pub tables_visited: usize,
    pub unreadable_tables: usize,
    pub leaves: usize,
    /// The table budget ran out before the walk finished.
    pub truncated: bool,
    /// The backend went away; the walk stopped at that table.
    pub unavailable: bool,
}

/// Walks paging structures for one [`PagingMode`].
#[derive(Debug, Clone, Copy)]
pub struct PagingWalker {
    mode: PagingMode,
}

impl PagingWalker {
    pub fn new(mode: PagingMode) -> Self {
        PagingWalker { mode }
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    fn fault(level: &'static str, entry_address: u64, fault: EntryFault) -> Unresolved {
        match fault {
            EntryFault::ShortRead => Unresolved::BackendFailure {
                level,
                entry_address,
                timed_out: false,
            },
            EntryFault::Timeout => Unresolved::BackendFailure {
                level,
                entry_address,
                timed_out: true,
            },
            EntryFault::OutOfBounds => Unresolved::OutOfBounds {
                address: entry_address,
            },
            EntryFault::Unavailable => Unresolved::BackendUnavailable,
        }
    }

    /// Translate `va` starting at the paging root `root`.
    ///
    /// Never guesses: an unreadable entry anywhere on the path fails the
    /// translation with [`Unresolved::BackendFailure`].
    pub fn translate(
        &self,
        source: &dyn EntrySource,
        root: u64,
        va: u64,
    ) -> Result<Translation, Unresolved> {
        let mode = self.mode;
        let raw = mode
            .raw_address(va)
            .ok_or(Unresolved::OutOfBounds { address: va })?;
        let width = mode.entry_size();
        let levels = mode.levels();

        let mut table = mode.root_table(root);
        let mut flags = PageFlags::permissive();

        for (depth, level) in levels.iter().enumerate() {
            let shift = mode.level_shift(depth);
            let index = mask(raw, shift + level.index_bits - 1, shift) >> shift;
            let entry_address = table + index * width as u64;

            let entry = source
                .read_entry(entry_address, width)
                .map_err(|fault| Self::fault(level.name, entry_address, fault))?;

            if entry & PAGE_PRESENT == 0 {
                return Err(Unresolved::NotMapped {
                    level: level.name,
                    entry,
                });
            }
            flags = flags.descend(entry, mode, level.access_bits);

            let is_leaf = depth + 1 == levels.len() || (level.large_page && entry & PAGE_PSE != 0);
            if is_leaf {
                let base = mask(entry, mode.phys_bits() - 1, shift);
                let offset = if shift == 0 { 0 } else { mask(raw, shift - 1, 0) };
                return Ok(Translation {
                    physical_address: base | offset,
                    page_shift: shift,
                    flags,
                });
            }

            table = mask(entry, mode.phys_bits() - 1, FRAME_SHIFT);
        }

        // Every hierarchy ends in a leaf level, so the loop always returns.
        Err(Unresolved::NotMapped {
            level: "page table",
            entry: 0,
        })
    }

    /// Visit every present leaf whose raw virtual range overlaps `range`.
    ///
    /// Unreadable tables are skipped and counted. At most `max_tables`
    /// tables are read. Losing the backend ends the walk with
    /// [`WalkSummary::unavailable`] set.
    pub fn walk_range(
        &self,
        source: &dyn EntrySource,
        root: u64,
        range: Range<u64>,
        max_tables: usize,
        visit: &mut dyn FnMut(MappedPage),
    ) -> WalkSummary {
        let mut summary = WalkSummary::default();
        self.walk_table(
            source,
            self.mode.root_table(root),
            0,
            0,
            &range,
            PageFlags::permissive(),
            max_tables,
            visit,
            &mut summary,
        );
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_table(
        &self,
        source: &dyn EntrySource,
        table: u64,
        depth: usize,
        raw_base: u64,
        range: &Range<u64>,
        flags: PageFlags,
        max_tables: usize,
        visit: &mut dyn FnMut(MappedPage),
        summary: &mut WalkSummary,
    ) {
        let mode = self.mode;
        let levels = mode.levels();
        let level = &levels[depth];

        if summary.tables_visited >= max_tables {
            summary.truncated = true;
            return;
        }
        summary.tables_visited += 1;

        let shift = mode.level_shift(depth);
        let span = 1u64 << shift;
        let count = 1usize << level.index_bits;

        let entries = match source.read_table(table, count, mode.entry_size()) {
            Ok(entries) => entries,
            Err(EntryFault::Unavailable) => {
                summary.unavailable = true;
                return;
            }
            Err(_) => {
                summary.unreadable_tables += 1;
                return;
            }
        };

        for (index, entry) in entries.into_iter().enumerate() {
            let va = raw_base + index as u64 * span;
            if va.saturating_add(span) <= range.start || va >= range.end {
                continue;
            }
            if entry & PAGE_PRESENT == 0 {
                continue;
            }

            let flags = flags.descend(entry, mode, level.access_bits);
            let is_leaf = depth + 1 == levels.len() || (level.large_page && entry & PAGE_PSE != 0);

            if is_leaf {
                summary.leaves += 1;
                visit(MappedPage {
                    va: mode.canonical(va),
                    physical_address: mask(entry, mode.phys_bits() - 1, shift),
                    page_shift: shift,
                    flags,
                });
            } else {
                let next = mask(entry, mode.phys_bits() - 1, FRAME_SHIFT);
                self.walk_table(
                    source, next, depth + 1, va, range, flags, max_tables, visit, summary,
                );
            }

            if summary.truncated || summary.unavailable {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Sparse table memory keyed by entry address.
    #[derive(Default)]
    struct Tables {
        entries: HashMap<u64, u64>,
        unreadable: Vec<u64>,
        detached: Vec<u64>,
    }

    impl Tables {
        fn set(&mut self, address: u64, entry: u64) {
            self.entries.insert(address, entry);
        }
    }

    impl EntrySource for Tables {
        fn read_entry(&self, address: u64, _width: usize) -> Result<u64, EntryFault> {
            if self.unreadable.contains(&(address & !0xfff)) {
                return Err(EntryFault::ShortRead);
            }
            if self.detached.contains(&(address & !0xfff)) {
                return Err(EntryFault::Unavailable);
            }
            Ok(self.entries.get(&address).copied().unwrap_or(0))
        }
    }

    const P: u64 = PAGE_PRESENT | PAGE_WRITABLE | PAGE_USER;

    /// x64 tables mapping 0x7ff0_0000_1000 -> 0x5000 and a 2 MiB page at
    /// 0x4000_0000 -> 0x20_0000.
    fn x64_tables() -> Tables {
        let mut t = Tables::default();
        let va: u64 = 0x7ff0_0000_1000;
        let pml4 = (va >> 39) & 0x1ff;
        let pdpt = (va >> 30) & 0x1ff;
        let pd = (va >> 21) & 0x1ff;
        let pt = (va >> 12) & 0x1ff;
        t.set(0x1000 + pml4 * 8, 0x2000 | P);
        t.set(0x2000 + pdpt * 8, 0x3000 | P);
        t.set(0x3000 + pd * 8, 0x4000 | P);
        t.set(0x4000 + pt * 8, 0x5000 | P | PAGE_NX);

        // 0x4000_0000: pml4[0] -> pdpt 0x6000, pdpt[1] -> pd 0x7000, pd[0] large
        t.set(0x1000, 0x6000 | P);
        t.set(0x6000 + 8, 0x7000 | P);
        t.set(0x7000, 0x20_0000 | PAGE_PRESENT | PAGE_PSE);
        t
    }

    #[test]
    fn test_translate_4k() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);

        let t = walker.translate(&tables, 0x1000, 0x7ff0_0000_1234).unwrap();
        assert_eq!(t.physical_address, 0x5234);
        assert_eq!(t.page_size(), 0x1000);
        assert_eq!(t.backing(), PageBacking::Small);
        assert!(t.flags.writable && t.flags.user && t.flags.no_execute);
    }

    #[test]
    fn test_translate_large_page() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);

        let t = walker.translate(&tables, 0x1000, 0x4001_2345).unwrap();
        assert_eq!(t.physical_address, 0x21_2345);
        assert_eq!(t.page_shift, 21);
        assert_eq!(t.backing(), PageBacking::Large);
        assert!(!t.flags.writable);
    }

    #[test]
    fn test_translate_is_idempotent() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);
        let first = walker.translate(&tables, 0x1000, 0x7ff0_0000_1010);
        let second = walker.translate(&tables, 0x1000, 0x7ff0_0000_1010);
        assert_eq!(first, second);
    }

    #[test]
    fn test_not_mapped_vs_unreadable() {
        let mut tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);

        match walker.translate(&tables, 0x1000, 0x7ff0_0000_2000) {
            Err(Unresolved::NotMapped { level, .. }) => assert_eq!(level, "page table"),
            other => panic!("expected NotMapped, got {:?}", other),
        }

        tables.unreadable.push(0x4000);
        let err = walker.translate(&tables, 0x1000, 0x7ff0_0000_1000).unwrap_err();
        assert!(matches!(
            err,
            Unresolved::BackendFailure { level: "page table", .. }
        ));
        assert!(err.is_transient());
        assert_eq!(err.reason(), FailureReason::BackendFailure);
    }

    #[test]
    fn test_non_canonical_rejected() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);
        assert_eq!(
            walker.translate(&tables, 0x1000, 0x0001_0000_0000_0000),
            Err(Unresolved::OutOfBounds {
                address: 0x0001_0000_0000_0000
            })
        );
    }

    #[test]
    fn test_pae_translate() {
        let mut t = Tables::default();
        // PDPT at 0x1020, va 0x8040_3123: pdpt[2] -> pd 0x2000, pd[2] -> pt 0x3000, pt[3]
        t.set(0x1020 + 2 * 8, 0x2000 | PAGE_PRESENT);
        t.set(0x2000 + 2 * 8, 0x3000 | P);
        t.set(0x3000 + 3 * 8, 0x9000 | P);

        let walker = PagingWalker::new(PagingMode::Pae);
        let tr = walker.translate(&t, 0x1020, 0x8040_3123).unwrap();
        assert_eq!(tr.physical_address, 0x9123);
        // PDPT entries carry no access bits.
        assert!(tr.flags.writable && tr.flags.user);
        assert!(!tr.flags.no_execute);
    }

    #[test]
    fn test_x86_large_page() {
        let mut t = Tables::default();
        // va 0x8040_0123 -> pd index 0x201, 4 MiB page at 0x0080_0000
        t.set(0x1000 + 0x201 * 4, 0x0080_0000 | PAGE_PRESENT | PAGE_PSE);

        let walker = PagingWalker::new(PagingMode::X86);
        let tr = walker.translate(&t, 0x1000, 0x8040_0123).unwrap();
        assert_eq!(tr.physical_address, 0x0080_0123);
        assert_eq!(tr.page_shift, 22);
        assert_eq!(tr.backing(), PageBacking::Large);
    }

    #[test]
    fn test_walk_range() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);

        let mut pages = Vec::new();
        let summary = walker.walk_range(
            &tables,
            0x1000,
            PagingMode::X64.user_half(),
            1024,
            &mut |page| pages.push(page),
        );

        assert_eq!(summary.leaves, 2);
        assert_eq!(summary.unreadable_tables, 0);
        assert!(!summary.truncated);
        assert_eq!(pages[0].va, 0x4000_0000);
        assert_eq!(pages[0].page_shift, 21);
        assert_eq!(pages[1].va, 0x7ff0_0000_1000);
        assert_eq!(pages[1].physical_address, 0x5000);
    }

    #[test]
    fn test_walk_range_budget() {
        let tables = x64_tables();
        let walker = PagingWalker::new(PagingMode::X64);
        let summary = walker.walk_range(&tables, 0x1000, 0..u64::MAX, 2, &mut |_| {});
        assert!(summary.truncated);
        assert_eq!(summary.tables_visited, 2);
    }

    #[test]
    fn test_walk_range_stops_when_backend_lost() {
        let mut tables = x64_tables();
        tables.detached.push(0x6000);
        let walker = PagingWalker::new(PagingMode::X64);

        let mut leaves = 0;
        let summary = walker.walk_range(&tables, 0x1000, 0..u64::MAX, 1024, &mut |_| leaves += 1);
        assert!(summary.unavailable);
        assert_eq!(summary.unreadable_tables, 0);
        // The PML4 and the lost PDPT; nothing after it is visited.
        assert_eq!(summary.tables_visited, 2);
        assert_eq!(leaves, 0);
    }
}
