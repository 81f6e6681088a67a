//! memscatter: physical memory acquisition engine.
//!
//! Exposes a target's physical memory (a raw dump or a live acquisition
//! device) and the virtual address spaces of its processes:
//!
//! - [`PhysicalBackend`] abstracts the medium
//! - [`cache::PageCache`] keeps fully fetched 4 KiB frames
//! - [`paging::PagingWalker`] translates virtual addresses (x64, PAE, x86)
//! - [`MemoryEngine::scatter_read`] batches requests so each distinct frame
//!   costs at most one backend read
//! - [`space::AddressSpaceRegistry`] binds pids to paging roots
//!
//! ```rust,ignore
//! let engine = MemoryEngine::open(EngineConfig::file("/cases/mem.raw"))?;
//! engine.register_process(4, 0x1ad000, None);
//!
//! let (bytes, read) = engine.read_virtual(4, 0xfffff800_0000_0000, 0x100)?;
//! let mut items = vec![ScatterItem::new(0x1000, 8), ScatterItem::new(0x1008, 8)];
//! engine.scatter_read(Target::Process(4), &mut items, ReadFlags::default())?;
//! ```

pub mod access;
pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod paging;
pub mod ptemap;
pub mod scatter;
pub mod space;
pub mod traits;

#[cfg(test)]
mod fixtures;

pub use access::{PhysicalView, ProcessView};
pub use backend::{MmapFileBackend, RamBackend};
pub use config::{BackendSpec, EngineConfig, ProcessSpec};
pub use engine::{EngineStats, MemoryEngine};
pub use error::{Error, FailureReason, Result};
pub use paging::{PageBacking, PageFlags, PagingMode, Translation};
pub use ptemap::{PteMap, PteMapEntry, PTE_MAP_VERSION};
pub use scatter::{BatchReport, ItemStatus, ReadFlags, ScatterItem, ScatterWrite, Target};
pub use space::{ProcessAddressSpace, RootSelect};
pub use traits::{DeviceConnector, PhysicalBackend};
