//! Process address spaces.
//!
//! The registry binds a process id to the paging roots it was registered
//! with. Entries are immutable; re-registering a pid creates a new entry
//! with a fresh generation, and translations always work from an `Arc`
//! snapshot taken before the walk starts.

use crate::cache::RootKind;
use crate::error::{Error, Result};
use crate::paging::{frame_base, PagingMode};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which paging root a translation should start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootSelect {
    /// User root for user-half addresses when one is registered, kernel
    /// root otherwise.
    #[default]
    Auto,
    Kernel,
    User,
}

/// One registered generation of a process address space.
#[derive(Debug, Serialize)]
pub struct ProcessAddressSpace {
    pub pid: u32,
    /// Kernel (or only) paging root.
    pub dtb: u64,
    /// User-mode paging root under split kernel/user address spaces.
    pub dtb_user: Option<u64>,
    pub mode: PagingMode,
    pub generation: u64,
    /// Frames holding paging structures read on behalf of this space.
    #[serde(skip)]
    table_frames: RwLock<HashSet<u64>>,
}

impl ProcessAddressSpace {
    /// The root for a translation of `va`.
    pub fn root_for(&self, va: u64, select: RootSelect) -> (RootKind, u64) {
        match (select, self.dtb_user) {
            (RootSelect::User, Some(user)) => (RootKind::User, user),
            (RootSelect::Auto, Some(user)) if self.mode.is_user_address(va) => {
                (RootKind::User, user)
            }
            _ => (RootKind::Kernel, self.dtb),
        }
    }

    /// Remember a paging-structure frame. Frames already known only cost a
    /// shared lock, so parallel walks of one process do not serialize here.
    pub(crate) fn note_table_frame(&self, address: u64) {
        let base = frame_base(address);
        if self.table_frames.read().contains(&base) {
            return;
        }
        self.table_frames.write().insert(base);
    }

    /// Frames of paging structures touched so far.
    pub fn table_frames(&self) -> Vec<u64> {
        let mut frames: Vec<u64> = self.table_frames.read().iter().copied().collect();
        frames.sort_unstable();
        frames
    }
}

/// Lookup table from pid to its current address space.
pub struct AddressSpaceRegistry {
    spaces: RwLock<HashMap<u32, Arc<ProcessAddressSpace>>>,
    next_generation: AtomicU64,
}

impl Default for AddressSpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaceRegistry {
    pub fn new() -> Self {
        AddressSpaceRegistry {
            spaces: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register (or replace) the address space of `pid`.
    ///
    /// Returns the new space and the one it replaced, if any.
    pub fn register(
        &self,
        pid: u32,
        dtb: u64,
        dtb_user: Option<u64>,
        mode: PagingMode,
    ) -> (Arc<ProcessAddressSpace>, Option<Arc<ProcessAddressSpace>>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let space = Arc::new(ProcessAddressSpace {
            pid,
            dtb,
            dtb_user,
            mode,
            generation,
            table_frames: RwLock::new(HashSet::new()),
        });

        debug!("Registered pid {} at {:#x} (generation {})", pid, dtb, generation);
        let previous = self.spaces.write().insert(pid, Arc::clone(&space));
        (space, previous)
    }

    pub fn resolve(&self, pid: u32) -> Result<Arc<ProcessAddressSpace>> {
        self.spaces
            .read()
            .get(&pid)
            .cloned()
            .ok_or(Error::ProcessNotFound(pid))
    }

    /// Drop the address space of `pid` (process exit).
    pub fn invalidate(&self, pid: u32) -> Option<Arc<ProcessAddressSpace>> {
        let removed = self.spaces.write().remove(&pid);
        if let Some(space) = &removed {
            debug!("Invalidated pid {} (generation {})", pid, space.generation);
        }
        removed
    }

    /// Registered pids, ascending.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.spaces.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.spaces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let registry = AddressSpaceRegistry::new();
        registry.register(4, 0x1ad000, None, PagingMode::X64);

        let space = registry.resolve(4).unwrap();
        assert_eq!(space.dtb, 0x1ad000);
        assert!(matches!(registry.resolve(8), Err(Error::ProcessNotFound(8))));
    }

    #[test]
    fn test_reregister_bumps_generation() {
        let registry = AddressSpaceRegistry::new();
        let (first, _) = registry.register(100, 0x1000, None, PagingMode::X64);
        let (second, previous) = registry.register(100, 0x9000, None, PagingMode::X64);

        assert!(second.generation > first.generation);
        assert_eq!(previous.unwrap().generation, first.generation);
        assert_eq!(registry.resolve(100).unwrap().dtb, 0x9000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let registry = AddressSpaceRegistry::new();
        registry.register(100, 0x1000, None, PagingMode::X64);
        registry.register(4, 0x2000, None, PagingMode::X64);
        assert_eq!(registry.pids(), vec![4, 100]);

        assert!(registry.invalidate(100).is_some());
        assert!(registry.invalidate(100).is_none());
        assert!(registry.resolve(100).is_err());
        assert_eq!(registry.pids(), vec![4]);
    }

    #[test]
    fn test_root_selection() {
        let registry = AddressSpaceRegistry::new();
        let (space, _) = registry.register(100, 0x1000, Some(0x2000), PagingMode::X64);

        assert_eq!(
            space.root_for(0x7ff6_0000_0000, RootSelect::Auto),
            (RootKind::User, 0x2000)
        );
        assert_eq!(
            space.root_for(0xffff_f800_0000_0000, RootSelect::Auto),
            (RootKind::Kernel, 0x1000)
        );
        assert_eq!(
            space.root_for(0x7ff6_0000_0000, RootSelect::Kernel),
            (RootKind::Kernel, 0x1000)
        );

        let (kernel_only, _) = registry.register(4, 0x3000, None, PagingMode::X64);
        assert_eq!(
            kernel_only.root_for(0x1000, RootSelect::User),
            (RootKind::Kernel, 0x3000)
        );
    }

    #[test]
    fn test_table_frames() {
        let registry = AddressSpaceRegistry::new();
        let (space, _) = registry.register(1, 0x1000, None, PagingMode::X64);
        space.note_table_frame(0x3008);
        space.note_table_frame(0x1ff8);
        space.note_table_frame(0x3010);
        assert_eq!(space.table_frames(), vec![0x1000, 0x3000]);
    }

    #[test]
    fn test_table_frames_from_parallel_walks() {
        let registry = AddressSpaceRegistry::new();
        let (space, _) = registry.register(1, 0x1000, None, PagingMode::X64);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for round in 0..500u64 {
                        space.note_table_frame(0x1000 + (round % 4) * 0x1000 + 8);
                    }
                });
            }
        });
        assert_eq!(space.table_frames(), vec![0x1000, 0x2000, 0x3000, 0x4000]);
    }
}
