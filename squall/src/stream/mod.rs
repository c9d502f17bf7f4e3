// The diagnostic stream pool
//
// Every command buffer that runs instrumented work owns one
// "diagnostic allocation" while it is in flight: a device-local
// stream buffer the shaders append packed messages to, a host-mapped
// mirror the results are copied back into, and the descriptor set
// exposing the stream to shaders. The pool recycles these triples on
// timeline completion, estimates capacities from each tag's history,
// and feeds filled mirrors to the drain worker.
//
// Austin Shafer - 2025

pub mod drain;
pub use drain::DrainWorker;

use ash::vk;
use fxhash::FxHashMap;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::features::FeatureRegistry;
use crate::heap::{HeapBinding, HeapPool, MemClass};
use crate::kernels::HeaderSnapshot;
use crate::messages::{
    stream_buffer_size, StreamHeader, DEBUG_COOKIE_DEFAULT, DEBUG_COOKIE_MOVED, STREAM_HEADER_SIZE,
};
use crate::report::Report;
use crate::streamer::descpool::{DescPool, DiagDescriptor};
use crate::{CreateInfo, Result};
use sq_utils::log;
use sq_utils::ratelimit::RateLimiter;

use std::sync::{Arc, Mutex};

/// Capacity estimates grow by this factor after an overflow
const GROWTH_FACTOR: f32 = 1.5;
/// Weight of the previous average in the message count EWMA
const AVERAGE_WEIGHT: f32 = 0.9;
/// How many recent counts each tag's ring remembers
const TAG_RING_COUNT: usize = 4;
/// Free allocations untouched for this many reaps get destroyed
const DEAD_ALLOCATION_THRESHOLD: u32 = 16;
/// Run a defragmentation pass every this many reaps
const DEFRAG_INTERVAL: u32 = 256;

/// The host-mapped half of a stream
pub struct MirrorAllocation {
    pub(crate) ma_binding: HeapBinding,
    pub(crate) ma_buffer: vk::Buffer,
    pub(crate) ma_capacity: u32,
    /// Map failure left this mirror unreadable; it drains nothing and
    /// gets destroyed instead of pooled
    pub(crate) ma_dead: bool,
}

/// A per-command-buffer message stream
///
/// Owned by exactly one command buffer between its Reset and the
/// completion of its submission. After release it lives in the pool
/// or (its mirror) in the drain queue, never both.
pub struct DiagnosticAllocation {
    pub(crate) da_device_binding: HeapBinding,
    pub(crate) da_device_buffer: vk::Buffer,
    pub(crate) da_descriptor: DiagDescriptor,
    pub(crate) da_capacity: u32,
    pub(crate) da_mirror: Option<MirrorAllocation>,
    /// Opaque caller-supplied identity used for capacity estimation,
    /// zero when untagged
    pub(crate) da_tag: u64,
    /// Graphics timeline point that retires this allocation
    pub(crate) da_sync_point: u64,
    /// Reap passes this allocation has sat unused in the free list
    pub(crate) da_age: u32,
    /// Capped message count observed by the last filter pre-pass
    pub(crate) da_last_count: u32,
    /// Heuristic marker: this stream was busy enough to be a good
    /// async-transfer boundary
    pub(crate) da_is_transfer_sync_point: bool,
    pub(crate) da_cookie: u32,
}

impl DiagnosticAllocation {
    pub fn capacity(&self) -> u32 {
        self.da_capacity
    }

    pub fn device_buffer(&self) -> vk::Buffer {
        self.da_device_buffer
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.da_descriptor.set
    }

    pub fn is_transfer_sync_point(&self) -> bool {
        self.da_is_transfer_sync_point
    }
}

/// Ring of the most recent message counts for one tag
#[derive(Default, Clone)]
struct TagRing {
    tr_counts: [u32; TAG_RING_COUNT],
    tr_index: usize,
}

impl TagRing {
    fn push(&mut self, count: u32) {
        self.tr_index = (self.tr_index + 1) % TAG_RING_COUNT;
        self.tr_counts[self.tr_index] = count;
    }

    fn max(&self) -> u32 {
        *self.tr_counts.iter().max().unwrap()
    }
}

/// Per-tag stream capacity estimation
///
/// For every tag (a pipeline or draw identity) this remembers the
/// last overflow-scaled count and a short ring of recent counts; a
/// request takes the larger of the two, clamped between the default
/// and the hard limit.
pub struct CapacityEstimator {
    ce_default: u32,
    ce_limit: u32,
    /// Per tag: last observed count scaled by the growth factor
    ce_tag_scaled: FxHashMap<u64, u32>,
    /// Per tag: ring of recent counts
    ce_tag_rings: FxHashMap<u64, TagRing>,
}

impl CapacityEstimator {
    pub fn new(default_capacity: u32, limit: u32) -> Self {
        Self {
            ce_default: default_capacity,
            ce_limit: limit,
            ce_tag_scaled: FxHashMap::default(),
            ce_tag_rings: FxHashMap::default(),
        }
    }

    /// Capacity to request for a tag, derived from its history
    pub fn estimate(&self, tag: u64) -> u32 {
        let mut estimate = 0;
        if tag != 0 {
            if let Some(scaled) = self.ce_tag_scaled.get(&tag) {
                estimate = *scaled;
            }
            if let Some(ring) = self.ce_tag_rings.get(&tag) {
                estimate = std::cmp::max(estimate, ring.max());
            }
        }

        estimate.max(self.ce_default).min(self.ce_limit)
    }

    /// Account a retired stream's counts
    ///
    /// Returns true when the stream overflowed; the tag's stored
    /// count then grows by the growth factor so the next request is
    /// sized for what the workload actually produced.
    pub fn record(&mut self, tag: u64, written: u32, capacity: u32) -> bool {
        let overflow = written > capacity;

        if tag != 0 {
            if overflow {
                self.ce_tag_scaled
                    .insert(tag, (written as f32 * GROWTH_FACTOR) as u32);
            }
            self.ce_tag_rings
                .entry(tag)
                .or_default()
                .push(std::cmp::min(written, capacity));
        }
        overflow
    }
}

struct PoolInternal {
    /// Released allocations whose submissions are still in flight
    pi_pending: Vec<DiagnosticAllocation>,
    /// Retired allocations ready for reuse
    pi_free: Vec<DiagnosticAllocation>,
    /// Recycled mirrors detached from their drained allocations
    pi_mirrors: Vec<MirrorAllocation>,
    pi_estimator: CapacityEstimator,
    /// Smoothed message count across all streams
    pi_average_count: f32,
    pi_reap_counter: u32,
}

/// Pools per-command-buffer diagnostic streams
pub struct DiagnosticPool {
    dp_dev: Arc<Device>,
    dp_heaps: Arc<HeapPool>,
    dp_report: Arc<Mutex<Report>>,
    dp_drain: DrainWorker,
    /// Descriptor sets for the streams come from here. Guarded by its
    /// own mutex per the lock hierarchy.
    dp_desc: Mutex<DescPool>,
    /// Clamps written_count into transferred_count at readback time
    dp_snapshot: HeaderSnapshot,
    dp_internal: Mutex<PoolInternal>,
    dp_overflow_limiter: Mutex<RateLimiter>,

    // configuration, fixed at device bringup
    dp_viability_threshold: f32,
    dp_sync_point_threshold: f32,
    dp_latent_transfers: bool,
}

impl DiagnosticPool {
    pub fn new(
        dev: Arc<Device>,
        heaps: Arc<HeapPool>,
        features: Arc<FeatureRegistry>,
        report: Arc<Mutex<Report>>,
        info: &CreateInfo,
    ) -> Result<Self> {
        let desc = DescPool::new(dev.clone())?;
        let snapshot = HeaderSnapshot::new(dev.clone(), desc.layout())?;
        let drain = DrainWorker::new(heaps.clone(), features, report.clone());

        Ok(Self {
            dp_dev: dev,
            dp_heaps: heaps,
            dp_report: report,
            dp_drain: drain,
            dp_desc: Mutex::new(desc),
            dp_snapshot: snapshot,
            dp_internal: Mutex::new(PoolInternal {
                pi_pending: Vec::new(),
                pi_free: Vec::new(),
                pi_mirrors: Vec::new(),
                pi_estimator: CapacityEstimator::new(
                    info.command_buffer_message_count_default,
                    info.command_buffer_message_count_limit,
                ),
                pi_average_count: 0.0,
                pi_reap_counter: 0,
            }),
            dp_overflow_limiter: Mutex::new(RateLimiter::new(15)),
            dp_viability_threshold: info.allocation_viability_limit_threshold,
            dp_sync_point_threshold: info.transfer_sync_point_threshold,
            dp_latent_transfers: info.latent_transfers,
        })
    }

    /// A pooled stream may serve a request only if it is big enough
    /// and not absurdly oversized. Without the ratio guard one spike
    /// would inflate every allocation that follows.
    fn is_viable(&self, capacity: u32, requested: u32) -> bool {
        capacity >= requested
            && (capacity as f32 / requested as f32) <= self.dp_viability_threshold
    }

    /// Acquire a ready stream for a command buffer
    ///
    /// `tag` is an opaque identity (pipeline, draw call) used to size
    /// the stream from prior behavior, zero for no history.
    pub fn acquire(&self, tag: u64) -> Result<DiagnosticAllocation> {
        self.reap();

        let mut internal = self.dp_internal.lock().unwrap();
        let requested = internal.pi_estimator.estimate(tag);

        // Check the free list first
        if let Some(pos) = internal
            .pi_free
            .iter()
            .position(|a| self.is_viable(a.da_capacity, requested))
        {
            let mut alloc = internal.pi_free.remove(pos);
            alloc.da_tag = tag;
            alloc.da_age = 0;

            // The defragmenter may have asked this stream to move
            // while it sat idle
            self.commit_pending_rebind(&mut alloc)?;

            if alloc.da_mirror.is_none() {
                alloc.da_mirror = Some(self.pop_mirror(&mut internal, alloc.da_capacity)?);
            }
            self.reset_mirror_header(alloc.da_mirror.as_ref().unwrap(), alloc.da_capacity);
            return Ok(alloc);
        }
        drop(internal);

        self.create_allocation(requested, tag)
    }

    /// Park a released allocation until its submission retires
    ///
    /// `sync_point` is the graphics timeline point the owning
    /// submission signals.
    pub fn release(&self, mut alloc: DiagnosticAllocation, sync_point: u64) {
        alloc.da_sync_point = sync_point;
        self.dp_internal.lock().unwrap().pi_pending.push(alloc);
    }

    /// Retire completed allocations
    ///
    /// Runs on every acquire: any parked allocation whose timeline
    /// point has signaled goes through the filter pre-pass and back to
    /// the free list, and its mirror (if it saw messages) to the drain
    /// worker.
    pub fn reap(&self) {
        let completed = self.dp_dev.completed_timeline_point();
        let mut internal = self.dp_internal.lock().unwrap();

        // Reclaim mirrors the worker is done with
        let recycled = self.dp_drain.take_recycled();
        for mirror in recycled {
            if mirror.ma_dead {
                self.destroy_mirror(mirror);
            } else {
                internal.pi_mirrors.push(mirror);
            }
        }

        let mut done = Vec::new();
        let mut i = 0;
        while i < internal.pi_pending.len() {
            if internal.pi_pending[i].da_sync_point <= completed {
                done.push(internal.pi_pending.remove(i));
            } else {
                i += 1;
            }
        }

        for mut alloc in done {
            self.filter_prepass(&mut alloc, &mut internal);
            internal.pi_free.push(alloc);
        }

        // Age out free allocations nobody has wanted for a while
        let mut j = 0;
        while j < internal.pi_free.len() {
            internal.pi_free[j].da_age += 1;
            if internal.pi_free[j].da_age > DEAD_ALLOCATION_THRESHOLD {
                let alloc = internal.pi_free.remove(j);
                self.destroy_allocation(alloc, &mut internal);
            } else {
                j += 1;
            }
        }

        internal.pi_reap_counter += 1;
        if internal.pi_reap_counter % DEFRAG_INTERVAL == 0 {
            drop(internal);
            self.dp_heaps.defragment(MemClass::DeviceLocal);
            self.dp_heaps.defragment(MemClass::HostVisible);
        }
    }

    /// The synchronous message filter pre-pass
    ///
    /// Reads the mirror's header, accounts overflow and latency,
    /// updates the tag history and the running average, and decides
    /// whether the mirror carries anything worth draining.
    fn filter_prepass(&self, alloc: &mut DiagnosticAllocation, internal: &mut PoolInternal) {
        let mirror = match alloc.da_mirror.as_ref() {
            Some(m) => m,
            // Already filtered or never readable
            None => return,
        };
        if mirror.ma_dead {
            let dead = alloc.da_mirror.take().unwrap();
            self.destroy_mirror(dead);
            return;
        }

        if self.dp_heaps.invalidate_range(&mirror.ma_binding).is_err() {
            return;
        }

        let base = self.dp_heaps.mapped_ptr(&mirror.ma_binding);
        if base.is_null() {
            return;
        }
        let header = unsafe { std::ptr::read_unaligned(base as *const StreamHeader) };

        if header.debug_cookie != DEBUG_COOKIE_DEFAULT && header.debug_cookie != DEBUG_COOKIE_MOVED
        {
            log::error!(
                "diagnostic stream header corrupt, cookie {:#x}",
                header.debug_cookie
            );
            debug_assert!(false);
            return;
        }

        // Overflow: the shader-side counter ran past the slot count.
        // Nothing was lost silently, the capped count is reported
        // alongside the overflow counter, and the tag's estimate
        // grows for next time.
        let overflowed =
            internal
                .pi_estimator
                .record(alloc.da_tag, header.written_count, alloc.da_capacity);
        if overflowed {
            if self.dp_overflow_limiter.lock().unwrap().next() {
                log::error!(
                    "command buffer generated {} validation messages but its stream is capped to {}",
                    header.written_count,
                    alloc.da_capacity
                );
            }
            self.dp_report.lock().unwrap().overflows += 1;
        }

        // The counter may not represent the stored message count
        let last_count = std::cmp::min(header.written_count, alloc.da_capacity);
        alloc.da_last_count = last_count;

        // Smooth out the average count and deduce if this allocation
        // is a viable transfer sync point
        internal.pi_average_count = internal.pi_average_count * AVERAGE_WEIGHT
            + last_count as f32 * (1.0 - AVERAGE_WEIGHT);
        alloc.da_is_transfer_sync_point = internal.pi_average_count > 0.0
            && (last_count as f32 / internal.pi_average_count) > self.dp_sync_point_threshold;

        let visible = match self.dp_latent_transfers {
            // With latent transfers the mirror only holds what the
            // mid-work snapshot copied
            true => std::cmp::min(header.transferred_count, last_count),
            false => last_count,
        };

        {
            let mut report = self.dp_report.lock().unwrap();
            report.exported_messages += last_count as u64;

            if self.dp_latent_transfers {
                if header.transferred_count < last_count {
                    report.latent_undershoots += (last_count - header.transferred_count) as u64;
                }
                if header.transferred_count > last_count {
                    report.latent_overshoots += (header.transferred_count - last_count) as u64;
                }
            }
        }

        if visible > 0 {
            // Decouple the mirror, the allocation will pick up a fresh
            // one on reuse
            let mirror = alloc.da_mirror.take().unwrap();
            self.dp_drain.push(mirror, visible);
        }
    }

    /// Pop a pooled mirror able to hold `capacity` messages
    fn pop_mirror(
        &self,
        internal: &mut PoolInternal,
        capacity: u32,
    ) -> Result<MirrorAllocation> {
        if let Some(pos) = internal
            .pi_mirrors
            .iter()
            .position(|m| self.is_viable(m.ma_capacity, capacity))
        {
            return Ok(internal.pi_mirrors.remove(pos));
        }

        self.create_mirror(capacity)
    }

    fn create_mirror(&self, capacity: u32) -> Result<MirrorAllocation> {
        let size = stream_buffer_size(capacity);
        let (buffer, reqs) = self
            .dp_dev
            .create_unbound_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;

        let binding = match self.allocate_with_retry(MemClass::HostVisible, &reqs) {
            Ok(b) => b,
            Err(e) => {
                unsafe { self.dp_dev.dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        self.dp_heaps.bind_buffer(buffer, &binding)?;

        // A mirror we cannot read is still returned, just marked dead
        // so the filter pre-pass skips it and the payload stays zeroed
        let dead = self.dp_heaps.mapped_ptr(&binding).is_null();
        if dead {
            log::error!("could not map diagnostic mirror, stream will not be drained");
        }

        let mirror = MirrorAllocation {
            ma_binding: binding,
            ma_buffer: buffer,
            ma_capacity: capacity,
            ma_dead: dead,
        };
        self.reset_mirror_header(&mirror, capacity);
        Ok(mirror)
    }

    fn reset_mirror_header(&self, mirror: &MirrorAllocation, capacity: u32) {
        if mirror.ma_dead {
            return;
        }
        let base = self.dp_heaps.mapped_ptr(&mirror.ma_binding);
        if base.is_null() {
            return;
        }
        let header = StreamHeader {
            written_count: 0,
            capacity: capacity,
            debug_cookie: 0,
            transferred_count: 0,
        };
        unsafe { std::ptr::write_unaligned(base as *mut StreamHeader, header) };
        self.dp_heaps.flush_range(&mirror.ma_binding).ok();
    }

    /// Heap allocation with the device OOM policy: warn, force a
    /// defragmentation pass, retry once.
    fn allocate_with_retry(
        &self,
        class: MemClass,
        reqs: &vk::MemoryRequirements,
    ) -> Result<HeapBinding> {
        match self.dp_heaps.allocate(class, reqs.alignment, reqs.size) {
            Ok(b) => Ok(b),
            Err(e) => {
                log::error!("stream allocation failed ({:?}), defragmenting and retrying", e);
                self.dp_heaps.defragment(class);
                self.dp_heaps.allocate(class, reqs.alignment, reqs.size)
            }
        }
    }

    fn create_allocation(&self, capacity: u32, tag: u64) -> Result<DiagnosticAllocation> {
        let size = stream_buffer_size(capacity);
        let (buffer, reqs) = self.dp_dev.create_unbound_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        let binding = match self.allocate_with_retry(MemClass::DeviceLocal, &reqs) {
            Ok(b) => b,
            Err(e) => {
                unsafe { self.dp_dev.dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        self.dp_heaps.bind_buffer(buffer, &binding)?;

        let descriptor = {
            let mut desc = self.dp_desc.lock().unwrap();
            let d = desc.alloc_diag_set()?;
            desc.write_stream_buffer(&d, buffer, capacity);
            d
        };

        let mirror = {
            let mut internal = self.dp_internal.lock().unwrap();
            self.pop_mirror(&mut internal, capacity)?
        };

        Ok(DiagnosticAllocation {
            da_device_binding: binding,
            da_device_buffer: buffer,
            da_descriptor: descriptor,
            da_capacity: capacity,
            da_mirror: Some(mirror),
            da_tag: tag,
            da_sync_point: 0,
            da_age: 0,
            da_last_count: 0,
            da_is_transfer_sync_point: false,
            da_cookie: DEBUG_COOKIE_DEFAULT,
        })
    }

    /// Honor a pending defragmentation request on an idle stream
    ///
    /// The buffer is recreated at the requested offset. The driver
    /// reporting different requirements for the identical buffer is
    /// the one unrecoverable error in the engine.
    fn commit_pending_rebind(&self, alloc: &mut DiagnosticAllocation) -> Result<()> {
        if self
            .dp_heaps
            .rebind_target(&alloc.da_device_binding)
            .is_none()
        {
            return Ok(());
        }

        let size = stream_buffer_size(alloc.da_capacity);
        unsafe { self.dp_dev.dev.destroy_buffer(alloc.da_device_buffer, None) };
        let (buffer, reqs) = self.dp_dev.create_unbound_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        let new_binding = self.dp_heaps.commit_rebind(&alloc.da_device_binding, &reqs)?;
        self.dp_heaps.bind_buffer(buffer, &new_binding)?;

        alloc.da_device_buffer = buffer;
        alloc.da_device_binding = new_binding;
        alloc.da_cookie = DEBUG_COOKIE_MOVED;

        let mut desc = self.dp_desc.lock().unwrap();
        desc.write_stream_buffer(&alloc.da_descriptor, buffer, alloc.da_capacity);

        Ok(())
    }

    fn destroy_mirror(&self, mirror: MirrorAllocation) {
        unsafe { self.dp_dev.dev.destroy_buffer(mirror.ma_buffer, None) };
        self.dp_heaps.free(&mirror.ma_binding);
    }

    fn destroy_allocation(&self, alloc: DiagnosticAllocation, internal: &mut PoolInternal) {
        unsafe { self.dp_dev.dev.destroy_buffer(alloc.da_device_buffer, None) };
        self.dp_heaps.free(&alloc.da_device_binding);
        self.dp_desc.lock().unwrap().free_set(alloc.da_descriptor);

        // The mirror outlives its allocation and goes back to the pool
        if let Some(mirror) = alloc.da_mirror {
            if mirror.ma_dead {
                self.destroy_mirror(mirror);
            } else {
                internal.pi_mirrors.push(mirror);
            }
        }
    }

    /// Record commands zeroing the device stream's counters
    ///
    /// This runs before the application's work in the submission so
    /// the shaders start from a clean header. The barrier keeps the
    /// zeroing ordered against everything that follows.
    pub fn update_header(&self, cmd: vk::CommandBuffer, alloc: &DiagnosticAllocation) {
        let header = StreamHeader {
            written_count: 0,
            capacity: alloc.da_capacity,
            debug_cookie: alloc.da_cookie,
            transferred_count: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &header as *const StreamHeader as *const u8,
                STREAM_HEADER_SIZE as usize,
            )
        };

        unsafe {
            self.dp_dev
                .dev
                .cmd_update_buffer(cmd, alloc.da_device_buffer, 0, bytes);

            let barrier = vk::BufferMemoryBarrier::builder()
                .buffer(alloc.da_device_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    /// Record the counter clamp ahead of a readback
    ///
    /// `transferred_count = min(written_count, capacity)` at this
    /// point in the command stream. The shader-side counter is
    /// uncapped, the transferred count must only ever claim what the
    /// stream stored. Needs a compute-capable queue.
    fn record_header_snapshot(&self, cmd: vk::CommandBuffer, alloc: &DiagnosticAllocation) {
        unsafe {
            let barrier = vk::BufferMemoryBarrier::builder()
                .buffer(alloc.da_device_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }

        self.dp_snapshot.record(cmd, alloc.descriptor_set());
    }

    /// Record the device-to-mirror copy and the host barrier
    ///
    /// Queue-agnostic half of the readback, the transfer queue runs
    /// it too.
    fn record_mirror_copy(
        &self,
        cmd: vk::CommandBuffer,
        alloc: &DiagnosticAllocation,
        mirror: &MirrorAllocation,
    ) {
        unsafe {
            let barrier = vk::BufferMemoryBarrier::builder()
                .buffer(alloc.da_device_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );

            let copy = vk::BufferCopy::builder()
                .src_offset(0)
                .dst_offset(0)
                .size(stream_buffer_size(alloc.da_capacity))
                .build();
            self.dp_dev.dev.cmd_copy_buffer(
                cmd,
                alloc.da_device_buffer,
                mirror.ma_buffer,
                &[copy],
            );

            let host_barrier = vk::BufferMemoryBarrier::builder()
                .buffer(mirror.ma_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[host_barrier],
                &[],
            );
        }
    }

    /// Record the end-of-submission readback into the mirror
    ///
    /// Clamps the counter into transferred_count first so the mirror
    /// is self-describing even if the producing queue keeps appending
    /// after the copy.
    pub fn record_readback(&self, cmd: vk::CommandBuffer, alloc: &DiagnosticAllocation) {
        let mirror = match alloc.da_mirror.as_ref() {
            Some(m) if !m.ma_dead => m,
            _ => return,
        };

        self.record_header_snapshot(cmd, alloc);
        self.record_mirror_copy(cmd, alloc, mirror);
    }

    /// Release the stream to the transfer queue for a mid-work
    /// readback
    ///
    /// Only used with latent transfers. The counter clamp has to run
    /// here, on the producing queue, because the transfer queue the
    /// stream is handed to cannot dispatch compute. The ownership
    /// transfer barrier pairs with an acquire recorded by
    /// end_transfer on the transfer queue's command buffer.
    pub fn begin_transfer(&self, cmd: vk::CommandBuffer, alloc: &DiagnosticAllocation) {
        if !self.dp_latent_transfers {
            return;
        }

        self.record_header_snapshot(cmd, alloc);

        unsafe {
            let release = vk::BufferMemoryBarrier::builder()
                .buffer(alloc.da_device_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .src_queue_family_index(self.dp_dev.d_graphics_family)
                .dst_queue_family_index(self.dp_dev.d_transfer_family)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[release],
                &[],
            );
        }
    }

    /// Acquire the stream on the transfer queue and copy what the
    /// snapshot claims back to the mirror.
    pub fn end_transfer(&self, cmd: vk::CommandBuffer, alloc: &DiagnosticAllocation) {
        if !self.dp_latent_transfers {
            return;
        }
        let mirror = match alloc.da_mirror.as_ref() {
            Some(m) if !m.ma_dead => m,
            _ => return,
        };

        unsafe {
            let acquire = vk::BufferMemoryBarrier::builder()
                .buffer(alloc.da_device_buffer)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE)
                .src_queue_family_index(self.dp_dev.d_graphics_family)
                .dst_queue_family_index(self.dp_dev.d_transfer_family)
                .build();
            self.dp_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[acquire],
                &[],
            );
        }

        self.record_mirror_copy(cmd, alloc, mirror);
    }

    /// Flush the drain worker
    pub fn wait_for_filtering(&self) {
        self.dp_drain.wait_idle();
    }

    /// Gate message transformation without stalling the application
    pub fn set_paused(&self, paused: bool) {
        self.dp_drain.set_paused(paused);
    }

    pub fn get_desc_pool(&self) -> &Mutex<DescPool> {
        &self.dp_desc
    }

    pub fn get_heaps(&self) -> Arc<HeapPool> {
        self.dp_heaps.clone()
    }

    pub fn get_device(&self) -> Arc<Device> {
        self.dp_dev.clone()
    }

    pub fn shutdown(&self) {
        self.dp_drain.shutdown();

        let mut internal = self.dp_internal.lock().unwrap();
        let pending: Vec<_> = internal.pi_pending.drain(..).collect();
        let free: Vec<_> = internal.pi_free.drain(..).collect();
        for alloc in pending.into_iter().chain(free) {
            self.destroy_allocation(alloc, &mut internal);
        }
        let mirrors: Vec<_> = internal.pi_mirrors.drain(..).collect();
        for mirror in mirrors {
            self.destroy_mirror(mirror);
        }
    }
}
