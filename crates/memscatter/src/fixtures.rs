//! Test fixtures: an operation-counting backend and a page table builder.

use crate::backend::RamBackend;
use crate::error::Result;
use crate::paging::{mask, PagingMode, PAGE_PRESENT, PAGE_PSE, PAGE_USER, PAGE_WRITABLE};
use crate::traits::PhysicalBackend;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps a [`RamBackend`] and counts the calls that reach it.
pub(crate) struct CountingBackend {
    ram: RamBackend,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingBackend {
    pub(crate) fn new(size: u64) -> Self {
        Self::from_ram(RamBackend::new("counting", size))
    }

    pub(crate) fn from_ram(ram: RamBackend) -> Self {
        CountingBackend {
            ram,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ram(&self) -> &RamBackend {
        &self.ram
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_counts(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }
}

impl PhysicalBackend for CountingBackend {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.ram.read_into(address, buf)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.ram.write(address, data)
    }

    fn name(&self) -> &str {
        self.ram.name()
    }

    fn size(&self) -> u64 {
        self.ram.size()
    }

    fn is_writable(&self) -> bool {
        self.ram.is_writable()
    }
}

/// Builds paging structures inside a [`RamBackend`].
///
/// Tables are allocated one frame at a time from `next_table` upwards, so the
/// caller must keep that region free of other data.
pub(crate) struct PageTableBuilder<'a> {
    ram: &'a RamBackend,
    mode: PagingMode,
    root: u64,
    next_table: u64,
}

impl<'a> PageTableBuilder<'a> {
    pub(crate) fn new(ram: &'a RamBackend, mode: PagingMode, root: u64, next_table: u64) -> Self {
        PageTableBuilder {
            ram,
            mode,
            root,
            next_table,
        }
    }

    fn width(&self) -> u64 {
        self.mode.entry_size() as u64
    }

    fn index(&self, raw: u64, depth: usize) -> u64 {
        let shift = self.mode.level_shift(depth);
        let bits = self.mode.levels()[depth].index_bits;
        (raw >> shift) & ((1 << bits) - 1)
    }

    fn read_entry(&self, address: u64) -> u64 {
        let (bytes, _) = self.ram.read(address, self.mode.entry_size()).unwrap();
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(&bytes);
        u64::from_le_bytes(raw)
    }

    fn write_entry(&self, address: u64, value: u64) {
        match self.mode.entry_size() {
            4 => self.ram.poke(address, &(value as u32).to_le_bytes()),
            _ => self.ram.poke_u64(address, value),
        }
    }

    fn next_level(&self, entry: u64) -> u64 {
        mask(entry, self.mode.phys_bits() - 1, 12)
    }

    /// Physical address of the table used at `depth` for `va`, if the path
    /// down to it exists.
    pub(crate) fn table_for(&self, va: u64, depth: usize) -> Option<u64> {
        let raw = self.mode.raw_address(va)?;
        let mut table = self.mode.root_table(self.root);
        for level in 0..depth {
            let entry = self.read_entry(table + self.index(raw, level) * self.width());
            if entry & PAGE_PRESENT == 0 {
                return None;
            }
            table = self.next_level(entry);
        }
        Some(table)
    }

    fn map_at(&mut self, va: u64, pa: u64, leaf_depth: usize, leaf_flags: u64) {
        let raw = self.mode.raw_address(va).unwrap();
        let mut table = self.mode.root_table(self.root);

        for depth in 0..leaf_depth {
            let entry_address = table + self.index(raw, depth) * self.width();
            let mut entry = self.read_entry(entry_address);
            if entry & PAGE_PRESENT == 0 {
                entry = self.next_table | PAGE_PRESENT | PAGE_WRITABLE | PAGE_USER;
                self.next_table += 0x1000;
                self.write_entry(entry_address, entry);
            }
            table = self.next_level(entry);
        }

        let leaf = table + self.index(raw, leaf_depth) * self.width();
        self.write_entry(leaf, pa | PAGE_PRESENT | leaf_flags);
    }

    /// Map one 4 KiB user page.
    pub(crate) fn map_page(&mut self, va: u64, pa: u64, writable: bool) {
        let leaf_depth = self.mode.levels().len() - 1;
        let flags = PAGE_USER | if writable { PAGE_WRITABLE } else { 0 };
        self.map_at(va, pa, leaf_depth, flags);
    }

    /// Map a 4 KiB page with explicit entry flags (present is implied).
    pub(crate) fn map_page_with(&mut self, va: u64, pa: u64, flags: u64) {
        let leaf_depth = self.mode.levels().len() - 1;
        self.map_at(va, pa, leaf_depth, flags);
    }

    /// Map a large page with a directory entry at `depth`.
    pub(crate) fn map_large(&mut self, va: u64, pa: u64, depth: usize) {
        self.map_at(va, pa, depth, PAGE_PSE | PAGE_WRITABLE | PAGE_USER);
    }

    /// Map consecutive pages `va..` to consecutive frames `pa..`.
    pub(crate) fn map_range(&mut self, va: u64, pa: u64, pages: Range<u64>) {
        for page in pages {
            self.map_page(va + page * 0x1000, pa + page * 0x1000, true);
        }
    }
}
