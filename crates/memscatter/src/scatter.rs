//! Scatter-gather execution.
//!
//! A batch is executed in three phases:
//!
//! 1. every distinct virtual page is translated once (in parallel),
//! 2. the resulting segments are grouped by physical frame and every distinct
//!    frame is fetched once through the cache (in parallel, bounded by the
//!    engine's I/O pool),
//! 3. frame bytes are scattered back into the items.
//!
//! Items succeed or fail independently. Only a backend that disappears
//! mid-batch turns into an `Err` for the whole call.

use crate::engine::{Frame, MemoryEngine};
use crate::error::{Error, FailureReason, Result};
use crate::paging::{frame_base, frame_offset, Translation, Unresolved, FRAME_SIZE};
use crate::space::{ProcessAddressSpace, RootSelect};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Options for a read batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Always fetch from the backend. The cache is refreshed afterwards.
    pub bypass_cache: bool,
    /// Zero the buffers of failed items instead of leaving them untouched.
    pub zero_pad_on_failure: bool,
    /// Treat every address as physical.
    pub suppress_paging: bool,
}

impl ReadFlags {
    pub fn with_bypass_cache(mut self, on: bool) -> Self {
        self.bypass_cache = on;
        self
    }

    pub fn with_zero_pad_on_failure(mut self, on: bool) -> Self {
        self.zero_pad_on_failure = on;
        self
    }

    pub fn with_suppress_paging(mut self, on: bool) -> Self {
        self.suppress_paging = on;
        self
    }
}

/// Address space a batch is issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Physical,
    Process(u32),
}

/// Outcome of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Complete,
    Failed(FailureReason),
}

/// One read request of at most one frame.
#[derive(Debug, Clone)]
pub struct ScatterItem {
    pub address: u64,
    /// Caller-owned buffer; its length is the requested length.
    pub buf: Vec<u8>,
    pub status: ItemStatus,
    /// Bytes actually obtained, counted from the start of the item.
    pub read: usize,
}

impl ScatterItem {
    /// An item reading `length` bytes into a zeroed buffer.
    pub fn new(address: u64, length: usize) -> Self {
        Self::with_buffer(address, vec![0u8; length])
    }

    pub fn with_buffer(address: u64, buf: Vec<u8>) -> Self {
        ScatterItem {
            address,
            buf,
            status: ItemStatus::Pending,
            read: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Complete
    }

    /// The bytes read, if the item succeeded.
    pub fn data(&self) -> Option<&[u8]> {
        self.is_success().then_some(&self.buf[..])
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.status {
            ItemStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// One write request of at most one frame.
#[derive(Debug, Clone)]
pub struct ScatterWrite {
    pub address: u64,
    pub data: Vec<u8>,
    pub status: ItemStatus,
    /// Bytes accepted by the backend, counted from the start of the item.
    pub accepted: usize,
}

impl ScatterWrite {
    pub fn new(address: u64, data: Vec<u8>) -> Self {
        ScatterWrite {
            address,
            data,
            status: ItemStatus::Pending,
            accepted: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Complete
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.status {
            ItemStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Summary of an executed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub items: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Distinct physical frames the batch touched.
    pub frames: usize,
    /// Frames that had to come from the backend.
    pub backend_reads: usize,
    /// Distinct virtual pages translated.
    pub translations: usize,
}

/// The part of an item that falls inside one frame.
#[derive(Debug, Clone, Copy)]
struct Segment {
    item: usize,
    item_offset: usize,
    address: u64,
    len: usize,
}

/// Where the segments of a batch landed.
struct Plan {
    segments: Vec<Segment>,
    /// Segment index range of each item.
    ranges: Vec<Range<usize>>,
    /// Item failures known before any I/O.
    failures: Vec<Option<FailureReason>>,
}

impl Plan {
    fn new(requests: impl Iterator<Item = (u64, usize)>) -> Self {
        let mut plan = Plan {
            segments: Vec::new(),
            ranges: Vec::new(),
            failures: Vec::new(),
        };

        for (item, (address, len)) in requests.enumerate() {
            let start = plan.segments.len();
            let failure = if len > FRAME_SIZE {
                Some(FailureReason::InvalidRequest)
            } else if len > 0 && address.checked_add(len as u64 - 1).is_none() {
                Some(FailureReason::OutOfBounds)
            } else {
                let mut offset = 0;
                while offset < len {
                    let address = address + offset as u64;
                    let chunk = (FRAME_SIZE - frame_offset(address)).min(len - offset);
                    plan.segments.push(Segment {
                        item,
                        item_offset: offset,
                        address,
                        len: chunk,
                    });
                    offset += chunk;
                }
                None
            };
            plan.ranges.push(start..plan.segments.len());
            plan.failures.push(failure);
        }
        plan
    }

    fn fail_all(&mut self, reason: FailureReason) {
        for failure in self.failures.iter_mut() {
            failure.get_or_insert(reason);
        }
        self.segments.clear();
        for range in self.ranges.iter_mut() {
            *range = 0..0;
        }
    }
}

/// Per-segment physical resolution.
type Resolution = std::result::Result<u64, FailureReason>;

impl MemoryEngine {
    fn batch_space(&self, target: Target, paging: bool) -> Result<Option<Arc<ProcessAddressSpace>>> {
        match target {
            Target::Process(pid) if paging => self.spaces.resolve(pid).map(Some),
            _ => Ok(None),
        }
    }

    /// Resolve every segment to a physical address. Sets `fatal` if the
    /// backend vanished during a walk.
    fn resolve_segments(
        &self,
        space: Option<&ProcessAddressSpace>,
        segments: &[Segment],
        report: &mut BatchReport,
        fatal: &mut bool,
    ) -> Vec<Resolution> {
        let size = self.backend.size();
        let in_bounds = |pa: u64| -> Resolution {
            if pa >= size {
                Err(FailureReason::OutOfBounds)
            } else {
                Ok(pa)
            }
        };

        let Some(space) = space else {
            return segments.iter().map(|seg| in_bounds(seg.address)).collect();
        };

        let pages: Vec<u64> = segments
            .iter()
            .map(|seg| frame_base(seg.address))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        report.translations = pages.len();

        let resolved: HashMap<u64, std::result::Result<Translation, Unresolved>> =
            self.pool.install(|| {
                pages
                    .par_iter()
                    .map(|&page| (page, self.translate_in(space, page, RootSelect::Auto)))
                    .collect()
            });

        segments
            .iter()
            .map(|seg| match resolved.get(&frame_base(seg.address)) {
                Some(Ok(translation)) => {
                    in_bounds(translation.physical_address + frame_offset(seg.address) as u64)
                }
                Some(Err(Unresolved::BackendUnavailable)) => {
                    *fatal = true;
                    Err(FailureReason::BackendUnavailable)
                }
                Some(Err(unresolved)) => Err(unresolved.reason()),
                None => Err(FailureReason::NotMapped),
            })
            .collect()
    }

    /// Execute a batch of reads.
    ///
    /// Every distinct frame costs at most one backend read regardless of how
    /// many items touch it. Returns `Err` only when the backend becomes
    /// unavailable; the items still carry their individual outcomes.
    pub fn scatter_read(
        &self,
        target: Target,
        items: &mut [ScatterItem],
        flags: ReadFlags,
    ) -> Result<BatchReport> {
        let mut report = BatchReport {
            items: items.len(),
            ..Default::default()
        };
        let mut plan = Plan::new(items.iter().map(|item| (item.address, item.len())));
        let mut fatal = false;

        let space = match self.batch_space(target, !flags.suppress_paging) {
            Ok(space) => space,
            Err(e) => {
                plan.fail_all(e.failure_reason());
                None
            }
        };

        // Phase 1: translate.
        let resolutions =
            self.resolve_segments(space.as_deref(), &plan.segments, &mut report, &mut fatal);

        // Phase 2: fetch each distinct frame once.
        let frames: Vec<u64> = resolutions
            .iter()
            .filter_map(|r| r.ok())
            .map(frame_base)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        report.frames = frames.len();

        let fetched: HashMap<u64, Result<Frame>> = self.pool.install(|| {
            frames
                .par_iter()
                .map(|&base| (base, self.fetch_frame(base, flags.bypass_cache)))
                .collect()
        });

        // Phase 3: scatter.
        for (index, item) in items.iter_mut().enumerate() {
            let mut failure = plan.failures[index];
            let mut pieces: Vec<(Segment, Arc<[u8]>, usize, usize)> = Vec::new();
            let mut read = 0;

            for seg_index in plan.ranges[index].clone() {
                if failure.is_some() {
                    break;
                }
                let seg = plan.segments[seg_index];
                let pa = match resolutions[seg_index] {
                    Ok(pa) => pa,
                    Err(reason) => {
                        failure = Some(reason);
                        break;
                    }
                };

                match fetched.get(&frame_base(pa)) {
                    Some(Ok(frame)) => {
                        let offset = frame_offset(pa);
                        let available = frame.valid.saturating_sub(offset).min(seg.len);
                        pieces.push((seg, Arc::clone(&frame.data), offset, available));
                        read += available;
                        if available < seg.len {
                            failure = Some(FailureReason::ShortRead);
                        }
                    }
                    Some(Err(e)) => {
                        if e.is_session_fatal() {
                            fatal = true;
                        }
                        failure = Some(e.failure_reason());
                    }
                    None => failure = Some(FailureReason::ShortRead),
                }
            }

            item.read = read;
            match failure {
                None => {
                    for (seg, data, offset, _) in &pieces {
                        item.buf[seg.item_offset..seg.item_offset + seg.len]
                            .copy_from_slice(&data[*offset..*offset + seg.len]);
                    }
                    item.status = ItemStatus::Complete;
                    report.succeeded += 1;
                }
                Some(reason) => {
                    if flags.zero_pad_on_failure {
                        item.buf.fill(0);
                        for (seg, data, offset, available) in &pieces {
                            item.buf[seg.item_offset..seg.item_offset + available]
                                .copy_from_slice(&data[*offset..*offset + available]);
                        }
                    }
                    item.status = ItemStatus::Failed(reason);
                    report.failed += 1;
                }
            }
        }

        report.backend_reads = fetched
            .values()
            .filter(|f| matches!(f, Ok(frame) if frame.from_backend))
            .count();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Scatter read: {} items ({} ok, {} failed), {} frames, {} backend reads, {} translations",
            report.items,
            report.succeeded,
            report.failed,
            report.frames,
            report.backend_reads,
            report.translations
        );

        if fatal {
            warn!("Backend '{}' became unavailable during a batch", self.backend.name());
            return Err(Error::backend_unavailable(
                self.backend.name(),
                "lost during scatter read",
            ));
        }
        Ok(report)
    }

    /// Execute a batch of writes.
    ///
    /// Segments landing in the same frame are coalesced into contiguous runs
    /// and written with one backend call per run. Acceptance is reported per
    /// item; it says nothing about when the bytes become visible.
    pub fn scatter_write(&self, target: Target, writes: &mut [ScatterWrite]) -> Result<BatchReport> {
        let mut report = BatchReport {
            items: writes.len(),
            ..Default::default()
        };
        let mut plan = Plan::new(writes.iter().map(|w| (w.address, w.data.len())));
        let mut fatal = false;

        let space = match self.batch_space(target, true) {
            Ok(space) => space,
            Err(e) => {
                plan.fail_all(e.failure_reason());
                None
            }
        };
        let resolutions =
            self.resolve_segments(space.as_deref(), &plan.segments, &mut report, &mut fatal);

        // Frame -> segment indices. Items with an unresolved segment are not
        // written at all.
        let mut by_frame: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (index, range) in plan.ranges.iter().enumerate() {
            let resolved = plan.failures[index].is_none()
                && resolutions[range.clone()].iter().all(|r| r.is_ok());
            if !resolved {
                continue;
            }
            for seg_index in range.clone() {
                if let Ok(pa) = resolutions[seg_index] {
                    by_frame.entry(frame_base(pa)).or_default().push(seg_index);
                }
            }
        }
        report.frames = by_frame.len();

        // Segment index -> (bytes accepted, failure).
        let mut outcome: Vec<(usize, Option<FailureReason>)> = resolutions
            .iter()
            .map(|r| (0, r.err()))
            .collect();
        let writable = self.backend.is_writable();
        let mut any_accepted = false;

        for (base, mut seg_indices) in by_frame {
            if !writable || fatal {
                for &i in &seg_indices {
                    outcome[i].1 = Some(if fatal {
                        FailureReason::BackendUnavailable
                    } else {
                        FailureReason::PartialWrite
                    });
                }
                continue;
            }

            seg_indices.sort_by_key(|&i| (resolutions[i].unwrap_or(base), i));
            for run in coalesce(&seg_indices, &plan.segments, &resolutions) {
                let mut buf = vec![0u8; (run.end - run.start) as usize];
                let mut members = run.members.clone();
                members.sort_unstable();
                for &i in &members {
                    let seg = plan.segments[i];
                    let at = (resolutions[i].unwrap_or(run.start) - run.start) as usize;
                    let data = &writes[seg.item].data[seg.item_offset..seg.item_offset + seg.len];
                    buf[at..at + seg.len].copy_from_slice(data);
                }

                self.counters.backend_writes.fetch_add(1, Ordering::Relaxed);
                let result = self.backend.write(run.start, &buf);
                let accepted = match result {
                    Ok(n) => n,
                    Err(e) => {
                        if e.is_session_fatal() {
                            fatal = true;
                        }
                        for &i in &members {
                            outcome[i].1 = Some(e.failure_reason());
                        }
                        continue;
                    }
                };
                if accepted > 0 {
                    any_accepted = true;
                    self.cache.invalidate(base);
                }

                let accepted_end = run.start + accepted as u64;
                for &i in &members {
                    let seg = plan.segments[i];
                    let pa = resolutions[i].unwrap_or(run.start);
                    let got = (accepted_end.saturating_sub(pa) as usize).min(seg.len);
                    outcome[i] = (
                        got,
                        (got < seg.len).then_some(FailureReason::PartialWrite),
                    );
                }
            }
        }

        if any_accepted {
            self.tlb.bump_epoch();
        }

        for (index, write) in writes.iter_mut().enumerate() {
            let mut failure = plan.failures[index];
            let mut accepted = 0;
            for seg_index in plan.ranges[index].clone() {
                if failure.is_some() {
                    break;
                }
                let (got, seg_failure) = outcome[seg_index];
                accepted += got;
                failure = seg_failure;
            }

            write.accepted = accepted;
            write.status = match failure {
                None => {
                    report.succeeded += 1;
                    ItemStatus::Complete
                }
                Some(reason) => {
                    report.failed += 1;
                    ItemStatus::Failed(reason)
                }
            };
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Scatter write: {} items ({} ok, {} failed), {} frames",
            report.items, report.succeeded, report.failed, report.frames
        );

        if fatal {
            warn!("Backend '{}' became unavailable during a batch", self.backend.name());
            return Err(Error::backend_unavailable(
                self.backend.name(),
                "lost during scatter write",
            ));
        }
        Ok(report)
    }
}

/// A contiguous physical byte range written with one backend call.
#[derive(Debug, Clone)]
struct Run {
    start: u64,
    end: u64,
    members: Vec<usize>,
}

/// Merge segments (sorted by physical address) whose ranges touch or overlap.
fn coalesce(sorted: &[usize], segments: &[Segment], resolutions: &[Resolution]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for &i in sorted {
        let Ok(start) = resolutions[i] else { continue };
        let end = start + segments[i].len as u64;
        match runs.last_mut() {
            Some(run) if start <= run.end => {
                run.end = run.end.max(end);
                run.members.push(i);
            }
            _ => runs.push(Run {
                start,
                end,
                members: vec![i],
            }),
        }
    }
    runs
}
