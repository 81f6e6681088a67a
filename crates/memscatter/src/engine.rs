//! The engine facade.
//!
//! [`MemoryEngine`] owns one acquisition session: the physical backend, the
//! frame and translation caches, the address-space registry and the worker
//! pool that issues backend reads for a batch. All entry points take `&self`
//! and may be called from many threads at once.

use crate::backend::{MmapFileBackend, RamBackend};
use crate::cache::{CacheStats, PageCache, TlbKey, TranslationCache};
use crate::config::{BackendSpec, EngineConfig};
use crate::error::{Error, Result};
use crate::paging::{
    frame_base, frame_offset, EntryFault, EntrySource, PagingWalker, Translation, Unresolved,
    FRAME_SIZE,
};
use crate::scatter::{ReadFlags, ScatterItem, ScatterWrite, Target};
use crate::space::{AddressSpaceRegistry, ProcessAddressSpace, RootSelect};
use crate::traits::{DeviceConnector, PhysicalBackend};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A frame as returned by the fetch path.
#[derive(Clone)]
pub(crate) struct Frame {
    pub data: Arc<[u8]>,
    /// Leading bytes the backend actually returned.
    pub valid: usize,
    /// Whether the backend was touched to produce this frame.
    pub from_backend: bool,
}

#[derive(Default)]
pub(crate) struct EngineCounters {
    pub backend_reads: AtomicU64,
    pub backend_writes: AtomicU64,
    pub translation_retries: AtomicU64,
    pub batches: AtomicU64,
}

/// Diagnostic counters of an engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub backend_reads: u64,
    pub backend_writes: u64,
    pub cache: CacheStats,
    pub cached_frames: usize,
    pub translation_cache_hits: u64,
    pub translation_retries: u64,
    pub batches: u64,
    pub processes: usize,
}

/// A memory acquisition session.
pub struct MemoryEngine {
    pub(crate) config: EngineConfig,
    pub(crate) backend: Arc<dyn PhysicalBackend>,
    pub(crate) cache: PageCache,
    pub(crate) tlb: TranslationCache,
    pub(crate) spaces: AddressSpaceRegistry,
    pub(crate) pool: rayon::ThreadPool,
    pub(crate) counters: EngineCounters,
}

impl MemoryEngine {
    /// Open the backend named by `config`.
    ///
    /// Device backends need a connector; use [`MemoryEngine::open_with_connector`]
    /// or [`MemoryEngine::with_backend`] for those.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_inner(config, None)
    }

    pub fn open_with_connector(config: EngineConfig, connector: &dyn DeviceConnector) -> Result<Self> {
        Self::open_inner(config, Some(connector))
    }

    fn open_inner(config: EngineConfig, connector: Option<&dyn DeviceConnector>) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn PhysicalBackend> = match &config.backend {
            BackendSpec::File { path, writable } => {
                Arc::new(MmapFileBackend::open("physical", path.clone(), *writable)?)
            }
            BackendSpec::Memory { size, read_only } => {
                let ram = RamBackend::new("memory", *size);
                Arc::new(if *read_only { ram.read_only() } else { ram })
            }
            BackendSpec::Device { identifier } => match connector {
                Some(connector) => connector.connect(identifier)?,
                None => {
                    return Err(Error::backend_unavailable(
                        identifier.clone(),
                        "no device connector configured",
                    ))
                }
            },
        };

        Self::with_backend(config, backend)
    }

    /// Build an engine around an already opened backend.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn PhysicalBackend>) -> Result<Self> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .thread_name(|i| format!("memscatter-io-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("cannot start I/O pool: {}", e)))?;

        let spaces = AddressSpaceRegistry::new();
        for process in &config.processes {
            spaces.register(process.pid, process.dtb, process.dtb_user, config.paging_mode);
        }

        info!(
            "Engine ready: backend '{}' ({:#x} bytes, {}), {} paging, {} cached frames",
            backend.name(),
            backend.size(),
            if backend.is_writable() { "writable" } else { "read-only" },
            config.paging_mode,
            config.cache_frames
        );

        Ok(MemoryEngine {
            cache: PageCache::new(config.cache_frames, config.cache_shards),
            tlb: TranslationCache::new(config.translation_cache, config.cache_shards),
            spaces,
            pool,
            backend,
            config,
            counters: EngineCounters::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn PhysicalBackend> {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Frame path
    // -----------------------------------------------------------------------

    /// Fetch the frame at `base` through the cache.
    ///
    /// With `bypass` the cache is not consulted, but a complete frame read
    /// from the backend still replaces whatever the cache held.
    pub(crate) fn fetch_frame(&self, base: u64, bypass: bool) -> Result<Frame> {
        if !bypass {
            if let Some(data) = self.cache.get(base) {
                return Ok(Frame {
                    data,
                    valid: FRAME_SIZE,
                    from_backend: false,
                });
            }
        }

        let version = self.cache.version(base);
        let mut buf = vec![0u8; FRAME_SIZE];
        self.counters.backend_reads.fetch_add(1, Ordering::Relaxed);
        let valid = self.backend.read_into(base, &mut buf)?;
        let data: Arc<[u8]> = buf.into();

        if valid == FRAME_SIZE {
            if !self.cache.put(base, Arc::clone(&data), version) && self.cache.is_enabled() {
                debug!("Frame {:#x} changed during its read; not cached", base);
            }
        } else if bypass {
            self.cache.invalidate(base);
        }

        Ok(Frame {
            data,
            valid,
            from_backend: true,
        })
    }

    // -----------------------------------------------------------------------
    // Physical access
    // -----------------------------------------------------------------------

    /// Read `length` bytes of physical memory.
    ///
    /// The buffer is always `length` long. The count says how many bytes were
    /// actually read; unreadable parts are zero.
    pub fn read_physical(&self, address: u64, length: usize) -> Result<(Vec<u8>, usize)> {
        self.read_physical_ex(address, length, ReadFlags::default())
    }

    pub fn read_physical_ex(
        &self,
        address: u64,
        length: usize,
        flags: ReadFlags,
    ) -> Result<(Vec<u8>, usize)> {
        self.read_range(Target::Physical, address, length, flags)
    }

    /// Write `data` at a physical address. Returns the bytes accepted.
    ///
    /// Accepted writes drop the cached frames they cover and retire cached
    /// translations, since the bytes may have been paging structures.
    pub fn write_physical(&self, address: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if address.checked_add(data.len() as u64).is_none() {
            return Err(Error::out_of_bounds(address, "write wraps the address space"));
        }
        if !self.backend.is_writable() {
            debug!("Write of {} bytes at {:#x} rejected: read-only backend", data.len(), address);
            return Ok(0);
        }

        self.counters.backend_writes.fetch_add(1, Ordering::Relaxed);
        let accepted = self.backend.write(address, data)?;
        if accepted > 0 {
            self.invalidate_written(address, data.len());
        }
        Ok(accepted)
    }

    pub(crate) fn invalidate_written(&self, address: u64, length: usize) {
        let end = address.saturating_add(length as u64);
        let mut base = frame_base(address);
        while base < end {
            self.cache.invalidate(base);
            base = match base.checked_add(FRAME_SIZE as u64) {
                Some(next) => next,
                None => break,
            };
        }
        self.tlb.bump_epoch();
    }

    // -----------------------------------------------------------------------
    // Virtual access
    // -----------------------------------------------------------------------

    pub fn read_virtual(&self, pid: u32, address: u64, length: usize) -> Result<(Vec<u8>, usize)> {
        self.read_virtual_ex(pid, address, length, ReadFlags::default())
    }

    /// Read process memory. Every page is read independently, so an unmapped
    /// page in the middle leaves a zero gap rather than ending the read. The
    /// count is the number of bytes actually read.
    ///
    /// With `suppress_paging` the address is taken as physical and `pid` is
    /// not consulted.
    pub fn read_virtual_ex(
        &self,
        pid: u32,
        address: u64,
        length: usize,
        flags: ReadFlags,
    ) -> Result<(Vec<u8>, usize)> {
        if !flags.suppress_paging {
            self.spaces.resolve(pid)?;
        }
        self.read_range(Target::Process(pid), address, length, flags)
    }

    /// Write process memory page by page. Stops at the first page that is
    /// not mapped or not fully accepted.
    pub fn write_virtual(&self, pid: u32, address: u64, data: &[u8]) -> Result<usize> {
        self.spaces.resolve(pid)?;
        if address.checked_add(data.len() as u64).is_none() {
            return Err(Error::out_of_bounds(address, "write wraps the address space"));
        }

        let mut writes: Vec<ScatterWrite> = frame_chunks(address, data.len())
            .map(|(chunk_address, offset, len)| {
                ScatterWrite::new(chunk_address, data[offset..offset + len].to_vec())
            })
            .collect();
        self.scatter_write(Target::Process(pid), &mut writes)?;

        let mut accepted = 0;
        for write in &writes {
            accepted += write.accepted;
            if !write.is_success() {
                if let Some(reason) = write.failure() {
                    debug!("Virtual write at {:#x} stopped: {}", write.address, reason);
                }
                break;
            }
        }
        Ok(accepted)
    }

    fn read_range(
        &self,
        target: Target,
        address: u64,
        length: usize,
        flags: ReadFlags,
    ) -> Result<(Vec<u8>, usize)> {
        if length == 0 {
            return Ok((Vec::new(), 0));
        }
        if address.checked_add(length as u64).is_none() {
            return Err(Error::out_of_bounds(address, "read wraps the address space"));
        }

        let mut items: Vec<ScatterItem> = frame_chunks(address, length)
            .map(|(chunk_address, _, len)| ScatterItem::new(chunk_address, len))
            .collect();

        // Buffers are fresh, so zero padding only decides whether partial
        // frames contribute their readable prefix.
        self.scatter_read(target, &mut items, flags.with_zero_pad_on_failure(true))?;

        let mut buf = Vec::with_capacity(length);
        let mut read = 0;
        for item in items {
            read += item.read;
            buf.extend_from_slice(&item.buf);
        }
        Ok((buf, read))
    }

    // -----------------------------------------------------------------------
    // Translation
    // -----------------------------------------------------------------------

    /// Translate a process virtual address to a physical address.
    pub fn translate(&self, pid: u32, address: u64) -> Result<u64> {
        Ok(self.translate_with(pid, address, RootSelect::Auto)?.physical_address)
    }

    /// Translate with an explicit root selection, returning the full mapping.
    pub fn translate_with(&self, pid: u32, address: u64, select: RootSelect) -> Result<Translation> {
        let space = self.spaces.resolve(pid)?;
        self.translate_in(&space, address, select)
            .map_err(|unresolved| unresolved.into_error(address, self.backend.name()))
    }

    /// Translate against a snapshot of an address space, through the
    /// translation cache, retrying transient table read failures.
    pub(crate) fn translate_in(
        &self,
        space: &ProcessAddressSpace,
        address: u64,
        select: RootSelect,
    ) -> std::result::Result<Translation, Unresolved> {
        let (root_kind, root) = space.root_for(address, select);
        let page = frame_base(address);
        let offset = frame_offset(address) as u64;
        let key = TlbKey {
            generation: space.generation,
            root: root_kind,
            page,
        };

        if let Some(translation) = self.tlb.get(&key) {
            return Ok(translation.offset_by(offset));
        }

        let epoch = self.tlb.epoch();
        let walker = PagingWalker::new(space.mode);
        let source = TableSource::new(self, Some(space));
        let mut attempt = 0;

        loop {
            match walker.translate(&source, root, page) {
                Ok(translation) => {
                    if translation.physical_address >= self.backend.size() {
                        debug!(
                            "Translation of {:#x} (pid {}) lands beyond the backend at {:#x}",
                            address, space.pid, translation.physical_address
                        );
                        return Err(Unresolved::OutOfBounds {
                            address: translation.physical_address,
                        });
                    }
                    self.tlb.put(key, epoch, translation);
                    return Ok(translation.offset_by(offset));
                }
                Err(unresolved)
                    if unresolved.is_transient() && attempt < self.config.translation_retries =>
                {
                    attempt += 1;
                    self.counters.translation_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Retrying translation of {:#x} (pid {}) after {:?} (attempt {})",
                        address, space.pid, unresolved, attempt
                    );
                }
                Err(unresolved) => {
                    debug!("Cannot translate {:#x} (pid {}): {:?}", address, space.pid, unresolved);
                    return Err(unresolved);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Address spaces
    // -----------------------------------------------------------------------

    /// Register (or replace) the address space of `pid` under the configured
    /// paging mode. Returns the generation assigned to it.
    pub fn register_process(&self, pid: u32, dtb: u64, dtb_user: Option<u64>) -> u64 {
        let (space, previous) = self
            .spaces
            .register(pid, dtb, dtb_user, self.config.paging_mode);
        if let Some(previous) = previous {
            self.retire_space(&previous);
        }
        space.generation
    }

    /// Forget the address space of `pid`. Later translations for it fail
    /// with [`Error::ProcessNotFound`] until it is registered again.
    pub fn invalidate_process(&self, pid: u32) -> bool {
        match self.spaces.invalidate(pid) {
            Some(space) => {
                self.retire_space(&space);
                true
            }
            None => false,
        }
    }

    fn retire_space(&self, space: &ProcessAddressSpace) {
        let frames = space.table_frames();
        debug!(
            "Retiring generation {} of pid {}: {} table frames",
            space.generation,
            space.pid,
            frames.len()
        );
        for frame in frames {
            self.cache.invalidate(frame);
        }
        self.tlb.bump_epoch();
    }

    pub fn process_info(&self, pid: u32) -> Result<Arc<ProcessAddressSpace>> {
        self.spaces.resolve(pid)
    }

    /// Registered pids, ascending.
    pub fn processes(&self) -> Vec<u32> {
        self.spaces.pids()
    }

    // -----------------------------------------------------------------------
    // Cache control
    // -----------------------------------------------------------------------

    /// Drop the cached frame containing `address`.
    pub fn invalidate_frame(&self, address: u64) {
        self.cache.invalidate(frame_base(address));
        self.tlb.bump_epoch();
    }

    /// Drop every cached frame and translation.
    pub fn invalidate_cache(&self) {
        debug!("Dropping {} cached frames", self.cache.len());
        self.cache.invalidate_all();
        self.tlb.clear();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            backend_reads: self.counters.backend_reads.load(Ordering::Relaxed),
            backend_writes: self.counters.backend_writes.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            cached_frames: self.cache.len(),
            translation_cache_hits: self.tlb.hits(),
            translation_retries: self.counters.translation_retries.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            processes: self.spaces.len(),
        }
    }
}

/// Split `address..address + length` at frame boundaries into
/// `(address, offset into the range, length)` chunks.
pub(crate) fn frame_chunks(address: u64, length: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= length {
            return None;
        }
        let chunk_address = address.wrapping_add(offset as u64);
        let len = (FRAME_SIZE - frame_offset(chunk_address)).min(length - offset);
        let chunk = (chunk_address, offset, len);
        offset += len;
        Some(chunk)
    })
}

/// Paging-structure reads through the frame cache.
pub(crate) struct TableSource<'a> {
    engine: &'a MemoryEngine,
    space: Option<&'a ProcessAddressSpace>,
}

impl<'a> TableSource<'a> {
    pub(crate) fn new(engine: &'a MemoryEngine, space: Option<&'a ProcessAddressSpace>) -> Self {
        TableSource { engine, space }
    }

    fn frame_for(&self, address: u64, length: usize) -> std::result::Result<Frame, EntryFault> {
        let end = address
            .checked_add(length as u64)
            .ok_or(EntryFault::OutOfBounds)?;
        if end > self.engine.backend.size() {
            return Err(EntryFault::OutOfBounds);
        }

        let base = frame_base(address);
        if let Some(space) = self.space {
            space.note_table_frame(base);
        }

        let frame = self.engine.fetch_frame(base, false).map_err(|e| match e {
            Error::BackendUnavailable { .. } => EntryFault::Unavailable,
            Error::BackendTimeout { .. } => EntryFault::Timeout,
            _ => EntryFault::ShortRead,
        })?;

        if frame.valid < frame_offset(address) + length {
            return Err(EntryFault::ShortRead);
        }
        Ok(frame)
    }
}

fn decode_entry(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = bytes.len().min(8);
    raw[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(raw)
}

impl EntrySource for TableSource<'_> {
    fn read_entry(&self, address: u64, width: usize) -> std::result::Result<u64, EntryFault> {
        let frame = self.frame_for(address, width)?;
        let offset = frame_offset(address);
        Ok(decode_entry(&frame.data[offset..offset + width]))
    }

    fn read_table(
        &self,
        address: u64,
        count: usize,
        width: usize,
    ) -> std::result::Result<Vec<u64>, EntryFault> {
        let length = count * width;
        let offset = frame_offset(address);
        if offset + length > FRAME_SIZE {
            return (0..count)
                .map(|i| self.read_entry(address + (i * width) as u64, width))
                .collect();
        }

        let frame = self.frame_for(address, length)?;
        Ok(frame.data[offset..offset + length]
            .chunks_exact(width)
            .map(decode_entry)
            .collect())
    }
}
