// The descriptor set streamer
//
// Instrumented shaders expect one extra descriptor set at a
// well-known slot: the diagnostic stream, the resource mapping
// tables, and the runtime constants. The application knows nothing
// about it and is free to clobber binding state at any time, so the
// streamer shadows everything the application binds per command
// buffer and replays it whenever a pipeline switch would leave either
// side looking wrong. From the application's point of view nothing
// changed; from the shader's point of view the diagnostic segment is
// always live at the expected slot.
//
// Austin Shafer - 2025

pub mod datachunk;
pub mod descpool;

use ash::vk;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::heap::{HeapBinding, MemClass};
use crate::stream::{DiagnosticAllocation, DiagnosticPool};
use crate::{Result, SquallError};
use datachunk::{DescriptorDataAllocator, SegmentPoint};
use sq_utils::log;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The most application descriptor set slots we shadow
pub const MAX_SETS: usize = 8;

/// Bytes of runtime constant data written at context open
const CONSTANT_DATA_BYTES: u64 = 256;

/// Monotonic source for context handles
static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The slice of pipeline layout state the streamer needs to shadow
/// and replay bindings
#[derive(Debug, Clone)]
pub struct PipelineLayoutInfo {
    pub layout: vk::PipelineLayout,
    /// Number of descriptor set slots the application's layout uses.
    /// The diagnostic segment binds at exactly this slot.
    pub user_slot_count: u32,
    /// Hash over the full layout compatibility state
    pub compat_hash: u64,
    /// Per-slot compatibility hashes, used to decide how much of the
    /// shadow must be replayed on a pipeline switch
    pub slot_hashes: [u64; MAX_SETS],
    /// Size of the application's push constant block
    pub push_constant_size: u32,
}

/// One pipeline as the streamer sees it at bind time
#[derive(Debug, Clone)]
pub struct BoundPipeline {
    pub handle: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
    pub layout: PipelineLayoutInfo,
    /// True when `handle` is the instrumented variant; only then does
    /// the diagnostic segment get bound
    pub instrumented: bool,
}

/// The application's view of one descriptor slot
#[derive(Debug, Clone)]
struct ShadowSet {
    sh_set: vk::DescriptorSet,
    sh_dynamic_offsets: Vec<u32>,
    /// Where this set's resource mappings live in the PRMT
    sh_prmt_offset: u32,
    sh_prmt_len: u32,
}

/// Per-command-buffer streamer state
///
/// Lives from Begin until Reset or submission retirement. All of the
/// shadowing, replay, and diagnostic segment maintenance for one
/// command buffer goes through here. Command buffers are externally
/// synchronized so this needs no lock of its own.
pub struct StreamState {
    ss_dev: Arc<Device>,
    ss_pool: Arc<DiagnosticPool>,
    ss_cmd: vk::CommandBuffer,

    /// The stream every instrumented dispatch in this command buffer
    /// exports into
    ss_alloc: Option<DiagnosticAllocation>,
    ss_pipeline: Option<BoundPipeline>,
    ss_bindings: [Option<ShadowSet>; MAX_SETS],
    /// Bit per slot: set when the application bound over the slot
    /// since the last pipeline switch
    ss_overwrite_mask: u32,
    /// Mirror of the application's push constant data for replay
    ss_push_shadow: Vec<u8>,
    ss_render_pass_active: bool,

    /// Streamed descriptor data (PRMT offsets and friends)
    ss_data: DescriptorDataAllocator,
    ss_segment: SegmentPoint,

    /// Host visible runtime constants for this context
    ss_const_binding: HeapBinding,
    ss_const_buffer: vk::Buffer,

    pub ss_context_handle: u64,
}

impl StreamState {
    /// Open streamer state for a freshly begun command buffer
    ///
    /// Acquires the diagnostic stream, clears every shadow, writes
    /// the reserved constant data, and records the header reset into
    /// the command buffer ahead of any application work.
    pub fn open(
        dev: Arc<Device>,
        pool: Arc<DiagnosticPool>,
        cmd: vk::CommandBuffer,
    ) -> Result<StreamState> {
        Self::open_tagged(dev, pool, cmd, 0)
    }

    /// Same as open, with a capacity estimation tag
    pub fn open_tagged(
        dev: Arc<Device>,
        pool: Arc<DiagnosticPool>,
        cmd: vk::CommandBuffer,
        tag: u64,
    ) -> Result<StreamState> {
        let alloc = pool.acquire(tag)?;
        pool.update_header(cmd, &alloc);

        let heaps = pool.get_heaps();
        let data = DescriptorDataAllocator::new(dev.clone(), heaps.clone())?;

        // Constants: event state, heap bounds, descriptor mappings
        let (const_buffer, reqs) = dev.create_unbound_buffer(
            CONSTANT_DATA_BYTES,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let const_binding = heaps.allocate(MemClass::HostVisible, reqs.alignment, reqs.size)?;
        heaps.bind_buffer(const_buffer, &const_binding)?;

        let mut state = StreamState {
            ss_dev: dev,
            ss_pool: pool,
            ss_cmd: cmd,
            ss_alloc: Some(alloc),
            ss_pipeline: None,
            ss_bindings: Default::default(),
            ss_overwrite_mask: 0,
            ss_push_shadow: Vec::new(),
            ss_render_pass_active: false,
            ss_data: data,
            ss_segment: SegmentPoint { base_entry: 0 },
            ss_const_binding: const_binding,
            ss_const_buffer: const_buffer,
            ss_context_handle: CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed),
        };

        state.write_reserved_constants();
        state.write_diag_descriptor();
        Ok(state)
    }

    /// Write the runtime constant block
    ///
    /// Layout: [0] context handle low, [1] context handle high,
    /// [2] stream capacity, [3] descriptor segment base. The rest is
    /// feature-owned and zeroed here.
    fn write_reserved_constants(&mut self) {
        let heaps = self.ss_pool.get_heaps();
        let base = heaps.mapped_ptr(&self.ss_const_binding);
        if base.is_null() {
            return;
        }

        let capacity = self.ss_alloc.as_ref().map(|a| a.capacity()).unwrap_or(0);
        unsafe {
            std::ptr::write_bytes(base, 0, CONSTANT_DATA_BYTES as usize);
            let words = base as *mut u32;
            words.add(0).write(self.ss_context_handle as u32);
            words.add(1).write((self.ss_context_handle >> 32) as u32);
            words.add(2).write(capacity);
            words.add(3).write(self.ss_segment.base_entry);
        }
        heaps.flush_range(&self.ss_const_binding).ok();
    }

    /// Update the diagnostic set's streamer-owned bindings
    fn write_diag_descriptor(&self) {
        let alloc = match self.ss_alloc.as_ref() {
            Some(a) => a,
            None => return,
        };
        let desc_pool = self.ss_pool.get_desc_pool().lock().unwrap();
        desc_pool.write_prmt(
            &alloc.da_descriptor,
            self.ss_data.current_buffer(),
            0,
            (datachunk::CHUNK_ENTRY_COUNT as u64) * 4,
        );
        desc_pool.write_constants(&alloc.da_descriptor, self.ss_const_buffer, CONSTANT_DATA_BYTES);
    }

    /// The application bound a pipeline
    ///
    /// If the new layout hashes identical to the shadow and nothing
    /// was overwritten, only the diagnostic segment goes back on.
    /// Otherwise the application slots invalidated by the switch are
    /// replayed from the shadow (the descriptor-restore protocol), so
    /// the application's observable state is exactly what it set, and
    /// then the segment goes back on top.
    pub fn bind_pipeline(&mut self, pipeline: &BoundPipeline) {
        let prev = self.ss_pipeline.take();

        let compatible = match prev.as_ref() {
            Some(p) => p.layout.compat_hash == pipeline.layout.compat_hash,
            None => false,
        };

        if !compatible || self.ss_overwrite_mask != 0 {
            self.restore_application_sets(
                prev.as_ref().map(|p| &p.layout),
                pipeline.bind_point,
                &pipeline.layout,
            );
        }

        self.ss_pipeline = Some(pipeline.clone());

        if pipeline.instrumented {
            self.bind_diag_segment();
        }
    }

    /// Replay the shadowed application sets invalidated by a layout
    /// switch and clear their overwrite bits
    ///
    /// Slot validity follows the prefix rule: a set bound under the
    /// previous layout survives onto the new one only while every
    /// slot at and below it hashes the same, and the first replayed
    /// slot disturbs everything above it. Overwritten slots replay
    /// unconditionally. The PRMT locations ride along, a replayed set
    /// is only coherent if the shader's mapping table moves with it.
    fn restore_application_sets(
        &mut self,
        prev_layout: Option<&PipelineLayoutInfo>,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayoutInfo,
    ) {
        let mut prefix_valid = prev_layout.is_some();

        for slot in 0..(layout.user_slot_count as usize).min(MAX_SETS) {
            if let Some(prev) = prev_layout {
                let hash_match = slot < (prev.user_slot_count as usize).min(MAX_SETS)
                    && prev.slot_hashes[slot] == layout.slot_hashes[slot];
                prefix_valid = prefix_valid && hash_match;
            }

            let overwritten = self.ss_overwrite_mask & (1 << slot) != 0;
            if prefix_valid && !overwritten {
                // Still valid under the new layout, leave it alone
                continue;
            }

            let shadow = match self.ss_bindings[slot].as_ref() {
                Some(s) => s.clone(),
                None => continue,
            };

            unsafe {
                self.ss_dev.dev.cmd_bind_descriptor_sets(
                    self.ss_cmd,
                    bind_point,
                    layout.layout,
                    slot as u32,
                    &[shadow.sh_set],
                    shadow.sh_dynamic_offsets.as_slice(),
                );
            }
            self.set_data_entry(slot as u32 * 2, shadow.sh_prmt_offset).ok();
            self.set_data_entry(slot as u32 * 2 + 1, shadow.sh_prmt_len).ok();
            self.ss_overwrite_mask &= !(1 << slot);

            // Re-issuing this slot perturbs every slot above it
            prefix_valid = false;
        }
    }

    /// Bind the diagnostic segment at the slot past the application's
    /// sets
    fn bind_diag_segment(&mut self) {
        let (pipeline, alloc) = match (self.ss_pipeline.as_ref(), self.ss_alloc.as_ref()) {
            (Some(p), Some(a)) => (p, a),
            _ => return,
        };

        unsafe {
            self.ss_dev.dev.cmd_bind_descriptor_sets(
                self.ss_cmd,
                pipeline.bind_point,
                pipeline.layout.layout,
                pipeline.layout.user_slot_count,
                &[alloc.descriptor_set()],
                &[],
            );
        }
    }

    /// The application bound a descriptor set
    ///
    /// `prmt_offset`/`prmt_len` locate the set's resource mappings in
    /// the physical resource mapping table.
    pub fn bind_descriptor_set(
        &mut self,
        slot: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
        prmt_offset: u32,
        prmt_len: u32,
    ) -> Result<()> {
        if slot as usize >= MAX_SETS {
            return Err(SquallError::INVALID);
        }

        self.ss_bindings[slot as usize] = Some(ShadowSet {
            sh_set: set,
            sh_dynamic_offsets: dynamic_offsets.to_vec(),
            sh_prmt_offset: prmt_offset,
            sh_prmt_len: prmt_len,
        });

        // Track overwrites of slots the current pipeline actually
        // consults, a later pipeline switch replays exactly these
        if let Some(pipeline) = self.ss_pipeline.as_ref() {
            if slot < pipeline.layout.user_slot_count {
                self.ss_overwrite_mask |= 1 << slot;
            }
        }

        // Stream the set's PRMT location so the shader can translate
        // virtual binding slots
        self.set_data_entry(slot * 2, prmt_offset)?;
        self.set_data_entry(slot * 2 + 1, prmt_len)?;
        Ok(())
    }

    fn set_data_entry(&mut self, index: u32, value: u32) -> Result<()> {
        // A roll here already migrated the segment, the descriptor
        // rebind happens at the next commit
        self.ss_data.set(index, value).map_err(|e| {
            log::error!("descriptor data write failed, aborting dispatch recording");
            e
        })?;
        Ok(())
    }

    /// D3D12-shaped descriptor heap switch
    ///
    /// Vulkan never emits this. Backends that carry descriptor heaps
    /// invalidate every persistent table parameter of the matching
    /// heap type and need a fresh diagnostic segment sourced from the
    /// new heap.
    pub fn set_descriptor_heap(&mut self, _heap_identity: u64) -> Result<()> {
        // Every shadowed slot must be replayed under the next pipeline
        self.ss_overwrite_mask = (1 << MAX_SETS) - 1;

        // Re-source the diagnostic segment
        let alloc = match self.ss_alloc.as_ref() {
            Some(a) => a,
            None => return Ok(()),
        };
        let mut desc_pool = self.ss_pool.get_desc_pool().lock().unwrap();
        let fresh = desc_pool.alloc_diag_set()?;
        desc_pool.write_stream_buffer(&fresh, alloc.device_buffer(), alloc.capacity());
        drop(desc_pool);

        let old = {
            let alloc = self.ss_alloc.as_mut().unwrap();
            std::mem::replace(&mut alloc.da_descriptor, fresh)
        };
        self.ss_pool.get_desc_pool().lock().unwrap().free_set(old);

        self.write_diag_descriptor();
        if self.ss_pipeline.as_ref().map(|p| p.instrumented).unwrap_or(false) {
            self.bind_diag_segment();
        }
        Ok(())
    }

    /// Mirror application push constants for replay
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        let end = offset as usize + data.len();
        if self.ss_push_shadow.len() < end {
            self.ss_push_shadow.resize(end, 0);
        }
        self.ss_push_shadow[offset as usize..end].copy_from_slice(data);
    }

    pub fn begin_render_pass(&mut self) {
        self.ss_render_pass_active = true;
    }

    pub fn end_render_pass(&mut self) {
        self.ss_render_pass_active = false;
    }

    /// Commit point before a draw, dispatch, or trace
    ///
    /// Guarantees the invariant the rewrite passes rely on: when an
    /// instrumented pipeline is bound, the diagnostic segment is live
    /// and its segment base is current. If the descriptor data rolled
    /// onto a new chunk since the last commit the segment is rebound
    /// and the new base pushed.
    pub fn commit(&mut self) -> Result<()> {
        let instrumented = self
            .ss_pipeline
            .as_ref()
            .map(|p| p.instrumented)
            .unwrap_or(false);
        if !instrumented {
            return Ok(());
        }

        if self.ss_data.take_rolled() {
            self.write_diag_descriptor();
            self.bind_diag_segment();
        }

        self.ss_segment = self.ss_data.current_segment();
        self.push_segment_base();

        self.ss_data.begin_segment();
        Ok(())
    }

    /// Push the current segment base through the reserved push
    /// constant range past the application's block
    fn push_segment_base(&self) {
        let pipeline = match self.ss_pipeline.as_ref() {
            Some(p) => p,
            None => return,
        };

        let value = [self.ss_segment.base_entry];
        let bytes = unsafe {
            std::slice::from_raw_parts(value.as_ptr() as *const u8, std::mem::size_of::<u32>())
        };
        unsafe {
            self.ss_dev.dev.cmd_push_constants(
                self.ss_cmd,
                pipeline.layout.layout,
                vk::ShaderStageFlags::ALL,
                pipeline.layout.push_constant_size,
                bytes,
            );
        }
    }

    /// Close out the context at End-Command-Buffer
    ///
    /// Commits host visible data, records the readback, and detaches
    /// the diagnostic allocation for the submit path to release
    /// against its timeline point.
    pub fn close(&mut self) -> Result<DiagnosticAllocation> {
        self.ss_data.commit()?;
        let heaps = self.ss_pool.get_heaps();
        heaps.flush_range(&self.ss_const_binding)?;

        let alloc = self.ss_alloc.take().ok_or(SquallError::INVALID)?;
        self.ss_pool.record_readback(self.ss_cmd, &alloc);

        self.ss_data.reset();
        self.ss_overwrite_mask = 0;
        self.ss_bindings = Default::default();
        self.ss_pipeline = None;
        self.ss_push_shadow.clear();

        Ok(alloc)
    }

    /// The overwrite mask, exposed for the command hooks
    pub fn overwrite_mask(&self) -> u32 {
        self.ss_overwrite_mask
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        self.ss_data.destroy();
        let heaps = self.ss_pool.get_heaps();
        unsafe { self.ss_dev.dev.destroy_buffer(self.ss_const_buffer, None) };
        heaps.free(&self.ss_const_binding);

        // A dropped context that was never closed still has to hand
        // its stream back. Nothing was submitted, so the already
        // completed point retires it on the next reap.
        if let Some(alloc) = self.ss_alloc.take() {
            let point = self.ss_dev.completed_timeline_point();
            self.ss_pool.release(alloc, point);
        }
    }
}
