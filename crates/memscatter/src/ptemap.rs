//! Page table memory map.
//!
//! Walks every paging structure of a process and reports the mapped virtual
//! memory as runs of pages with identical attributes.

use crate::engine::{MemoryEngine, TableSource};
use crate::error::{Error, Result};
use crate::paging::{MappedPage, PageBacking, PageFlags, PagingWalker, FRAME_SHIFT};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Layout version of [`PteMap`].
pub const PTE_MAP_VERSION: u32 = 2;

/// Upper bound on tables read for one map.
const MAX_TABLES: usize = 0x10000;

/// A run of virtually contiguous pages sharing flags and backing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PteMapEntry {
    pub va_base: u64,
    /// Run length in 4 KiB pages.
    pub page_count: u64,
    pub flags: PageFlags,
    pub backing: PageBacking,
}

impl PteMapEntry {
    pub fn size(&self) -> u64 {
        self.page_count << FRAME_SHIFT
    }

    pub fn va_end(&self) -> u64 {
        self.va_base.wrapping_add(self.size())
    }

    fn extends_with(&self, page: &MappedPage, backing: PageBacking) -> bool {
        self.va_end() == page.va && self.flags == page.flags && self.backing == backing
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PteMap {
    pub version: u32,
    pub pid: u32,
    pub entries: Vec<PteMapEntry>,
    /// Paging structures that could not be read and were skipped.
    pub unreadable_tables: usize,
    /// The walk stopped early at the table budget.
    pub truncated: bool,
}

impl PteMap {
    /// Total mapped pages.
    pub fn page_count(&self) -> u64 {
        self.entries.iter().map(|e| e.page_count).sum()
    }

    /// The run containing `va`.
    pub fn find(&self, va: u64) -> Option<&PteMapEntry> {
        self.entries
            .iter()
            .find(|e| va >= e.va_base && va < e.va_end())
    }
}

impl fmt::Display for PageBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PageBacking::Small => "4k",
            PageBacking::Large => "large",
            PageBacking::Huge => "huge",
        })
    }
}

impl fmt::Display for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.user { 'u' } else { 'k' },
            if self.writable { 'w' } else { 'r' },
            if self.no_execute { '-' } else { 'x' }
        )
    }
}

impl fmt::Display for PteMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(
                f,
                "{:04x} {:016x} {:08x} {} {}",
                i, entry.va_base, entry.page_count, entry.flags, entry.backing
            )?;
        }
        Ok(())
    }
}

impl MemoryEngine {
    /// Walk the complete paging hierarchy of `pid`.
    ///
    /// Under a split address space the user root covers the lower half and
    /// the kernel root the upper half.
    pub fn pte_map(&self, pid: u32) -> Result<PteMap> {
        let space = self.spaces.resolve(pid)?;
        let mode = space.mode;
        let walker = PagingWalker::new(mode);
        let source = TableSource::new(self, Some(&space));

        let roots = match space.dtb_user {
            Some(user) => vec![(user, mode.user_half()), (space.dtb, mode.kernel_half())],
            None => vec![(space.dtb, 0..1u64 << mode.virt_bits())],
        };

        let mut entries: Vec<PteMapEntry> = Vec::new();
        let mut unreadable_tables = 0;
        let mut truncated = false;
        let mut budget = MAX_TABLES;

        for (root, range) in roots {
            let summary = walker.walk_range(&source, root, range, budget, &mut |page| {
                let backing = page.backing();
                let pages = 1u64 << (page.page_shift - FRAME_SHIFT);
                match entries.last_mut() {
                    Some(last) if last.extends_with(&page, backing) => last.page_count += pages,
                    _ => entries.push(PteMapEntry {
                        va_base: page.va,
                        page_count: pages,
                        flags: page.flags,
                        backing,
                    }),
                }
            });
            if summary.unavailable {
                warn!("PTE map of pid {} aborted: backend lost", pid);
                return Err(Error::backend_unavailable(
                    self.backend.name(),
                    "lost during page table walk",
                ));
            }
            unreadable_tables += summary.unreadable_tables;
            truncated |= summary.truncated;
            budget = budget.saturating_sub(summary.tables_visited);
        }

        debug!(
            "PTE map of pid {}: {} runs, {} unreadable tables{}",
            pid,
            entries.len(),
            unreadable_tables,
            if truncated { ", truncated" } else { "" }
        );

        Ok(PteMap {
            version: PTE_MAP_VERSION,
            pid,
            entries,
            unreadable_tables,
            truncated,
        })
    }
}
