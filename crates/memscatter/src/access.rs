//! [`memview::MemoryAccess`] views over an engine.
//!
//! Structural parsers read through these views and never see the engine
//! itself.

use crate::engine::MemoryEngine;
use crate::error::Error;
use crate::paging::{frame_base, FRAME_SIZE};
use crate::scatter::ReadFlags;
use memview::MemoryAccess;

type AccessResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn require_full(address: u64, length: usize, read: (Vec<u8>, usize)) -> AccessResult<Vec<u8>> {
    let (bytes, count) = read;
    if count < length {
        return Err(Box::new(Error::ShortRead {
            address,
            requested: length,
            read: count,
        }));
    }
    Ok(bytes)
}

/// Physical memory as seen by structural parsers.
#[derive(Clone, Copy)]
pub struct PhysicalView<'a> {
    engine: &'a MemoryEngine,
    flags: ReadFlags,
}

impl<'a> PhysicalView<'a> {
    pub fn new(engine: &'a MemoryEngine) -> Self {
        PhysicalView {
            engine,
            flags: ReadFlags::default(),
        }
    }

    /// Read fresh from the backend instead of the cache.
    pub fn uncached(mut self) -> Self {
        self.flags = self.flags.with_bypass_cache(true);
        self
    }
}

impl MemoryAccess for PhysicalView<'_> {
    fn read(&self, offset: u64, length: usize) -> AccessResult<Vec<u8>> {
        let read = self.engine.read_physical_ex(offset, length, self.flags)?;
        require_full(offset, length, read)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        offset
            .checked_add(length)
            .is_some_and(|end| end <= self.engine.backend().size())
    }
}

/// One process's virtual memory as seen by structural parsers.
#[derive(Clone, Copy)]
pub struct ProcessView<'a> {
    engine: &'a MemoryEngine,
    pid: u32,
    flags: ReadFlags,
}

impl<'a> ProcessView<'a> {
    pub fn new(engine: &'a MemoryEngine, pid: u32) -> Self {
        ProcessView {
            engine,
            pid,
            flags: ReadFlags::default(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uncached(mut self) -> Self {
        self.flags = self.flags.with_bypass_cache(true);
        self
    }
}

impl MemoryAccess for ProcessView<'_> {
    fn read(&self, offset: u64, length: usize) -> AccessResult<Vec<u8>> {
        let read = self
            .engine
            .read_virtual_ex(self.pid, offset, length, self.flags)?;
        require_full(offset, length, read)
    }

    /// Every page the range touches must translate.
    fn is_valid(&self, offset: u64, length: u64) -> bool {
        let Some(end) = offset.checked_add(length.max(1)) else {
            return false;
        };
        let mut page = frame_base(offset);
        while page < end {
            if self.engine.translate(self.pid, page).is_err() {
                return false;
            }
            page = match page.checked_add(FRAME_SIZE as u64) {
                Some(next) => next,
                None => break,
            };
        }
        true
    }
}

impl MemoryEngine {
    pub fn physical(&self) -> PhysicalView<'_> {
        PhysicalView::new(self)
    }

    /// A view of `pid`'s address space. The pid is looked up on every read,
    /// so the view follows re-registration.
    pub fn process(&self, pid: u32) -> ProcessView<'_> {
        ProcessView::new(self, pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RamBackend;
    use crate::config::EngineConfig;
    use crate::fixtures::PageTableBuilder;
    use crate::paging::PagingMode;
    use crate::traits::PhysicalBackend;
    use memview::{parse_layouts_str, StructReader};
    use std::sync::Arc;

    const LAYOUT: &str = r#"{
        "types": {
            "list_entry": {
                "size": 16,
                "fields": {
                    "flink": { "offset": 0, "type": { "kind": "pointer" } },
                    "blink": { "offset": 8, "type": { "kind": "pointer" } }
                }
            },
            "kernel": {
                "size": 16,
                "fields": { "processes": { "offset": 0, "type": { "kind": "struct", "name": "list_entry" } } }
            },
            "process": {
                "size": 48,
                "fields": {
                    "pid": { "offset": 0, "type": { "kind": "u32" } },
                    "links": { "offset": 8, "type": { "kind": "struct", "name": "list_entry" } },
                    "name": { "offset": 24, "type": { "kind": "bytes", "count": 16 } }
                }
            }
        }
    }"#;

    const KVA: u64 = 0xffff_8000_0010_0000;

    /// A kernel process list spread over two virtual pages that map to
    /// non-adjacent frames.
    fn kernel_engine() -> MemoryEngine {
        let ram = RamBackend::new("view", 0x10_0000);
        {
            let mut b = PageTableBuilder::new(&ram, PagingMode::X64, 0x1000, 0x2000);
            b.map_page(KVA, 0x8_0000, true);
            b.map_page(KVA + 0x1000, 0x6_0000, true);
        }

        // head at KVA, processes at KVA + 0x100 and KVA + 0x1100.
        let head = KVA;
        let first = KVA + 0x100;
        let second = KVA + 0x1100;
        ram.poke_u64(0x8_0000, first + 8);
        let poke_process = |pa: u64, pid: u32, flink: u64, name: &[u8]| {
            ram.poke(pa, &pid.to_le_bytes());
            ram.poke_u64(pa + 8, flink);
            ram.poke(pa + 24, name);
        };
        poke_process(0x8_0100, 4, second + 8, b"System");
        poke_process(0x6_0100, 1234, head, b"notepad.exe");

        let backend: Arc<dyn PhysicalBackend> = Arc::new(ram);
        let engine = MemoryEngine::with_backend(EngineConfig::memory(0x10_0000), backend).unwrap();
        engine.register_process(4, 0x1000, None);
        engine
    }

    #[test]
    fn test_walk_process_list_through_view() {
        let engine = kernel_engine();
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let view = engine.process(4);

        let kernel = StructReader::new(&layouts, &view, KVA, "kernel").unwrap();
        let procs = kernel
            .walk_list("processes", "process", "links")
            .unwrap()
            .collect_all()
            .unwrap();

        let pids: Vec<u32> = procs.iter().map(|p| p.read_u32("pid").unwrap()).collect();
        assert_eq!(pids, vec![4, 1234]);
        assert_eq!(procs[1].read_string("name", 16).unwrap(), "notepad.exe");
    }

    #[test]
    fn test_view_validity() {
        let engine = kernel_engine();
        let view = engine.process(4);
        assert!(view.is_valid(KVA + 0xff0, 0x20));
        assert!(!view.is_valid(KVA + 0x1ff0, 0x20));
        assert!(view.read(KVA + 0x1ff0, 0x20).is_err());

        let physical = engine.physical();
        assert!(physical.is_valid(0xf_f000, 0x1000));
        assert!(!physical.is_valid(0xf_f000, 0x1001));
        assert_eq!(physical.read(0x8_0100, 4).unwrap(), 4u32.to_le_bytes().to_vec());
        assert!(physical.read(0xf_fffe, 4).is_err());
        assert!(engine.process(99).read(KVA, 4).is_err());
    }
}
