// The resource initialization tracker
//
// The canonical feature: it keeps one bit of GPU-resident state per
// texel saying "this has been written", rewrites shaders to test the
// bits covering every read and set them on every write, and
// intercepts API-side writes (copies, clears, resolves, render pass
// stores) with mask kernels so the bitset tracks non-shader writes
// too. A read that finds a clear bit exports an uninitialized
// resource message.
//
// The GPU-visible data contract the rewritten code relies on:
//   PRMT word (binding table):   puid[25:0] | failure_code[27:26]
//   shader data entry 0:         PUID -> base block map
//   shader data entry 1:         the global texel bitset
//
// Austin Shafer - 2025

use ash::vk;
use fxhash::FxHashMap;
use niebla as nb;
use spirv_headers::Op;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::heap::{HeapBinding, HeapPool, MemClass};
use crate::kernels::{CopyVariant, MaskKernels};
use crate::messages::{
    unpack_uninitialized, FailureCode, GpuMessage, MessageUid, INIT_DETAIL_MAX,
};
use crate::report::Report;
use crate::spv::{Block, InjectionPass, Module};
use crate::texelmem::{TexelAllocator, TexelMemoryBlock, TexelResourceInfo, UNTRACKED_BLOCK};
use crate::Result;
use sq_utils::log;

use super::{CommandHooks, Feature, FeatureReport, FeatureSet, PendingUpload};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Entries in the PUID -> base block map buffer. Resources minted
/// past this stay untracked.
pub const MAP_ENTRY_COUNT: u64 = 1 << 20;

/// PRMT geometry: words per descriptor set slot
pub const PRMT_BINDINGS_PER_SET: u32 = 64;

/// Host metadata for one tracked resource
#[derive(Debug, Clone)]
pub struct InitAllocation {
    pub info: TexelResourceInfo,
    pub block: Option<TexelMemoryBlock>,
    /// Host-mapped resources cannot be tracked, every CPU write
    /// bypasses the layer
    pub mapped: bool,
    pub failure_code: FailureCode,
    /// A whole-resource API write is in flight; promotion to the
    /// known-initialized set happens when its submission retires
    pub pending_whole_blit: bool,
}

/// GPU-side state, only alive between Instrumentation and Deactivate
struct GpuState {
    gs_texel: TexelAllocator,
    gs_kernels: MaskKernels,
    gs_map_buffer: vk::Buffer,
    gs_map_binding: HeapBinding,
}

pub struct InitializationFeature {
    if_dev: Arc<Device>,
    if_heaps: Arc<HeapPool>,
    if_gpu: Mutex<Option<GpuState>>,

    /// Per-PUID metadata
    if_meta: nb::Component<InitAllocation>,
    /// Host mirror of the PUID -> base block map
    if_map: nb::NonSparseComponent<u32>,

    /// Map entries written since the last flush, drained to the
    /// transfer queue before every batch submission
    if_pending_maps: Mutex<Vec<(u32, u32)>>,
    /// Blocks whose metadata still holds garbage, cleared on the
    /// compute queue before the owning resource is first used
    if_pending_clears: Mutex<Vec<(u32, TexelMemoryBlock)>>,

    /// Resources known fully written
    if_known_initialized: Mutex<HashSet<u32>>,
    /// (timeline point, puid) pairs for whole-resource writes whose
    /// submissions have not retired yet
    if_inflight_writes: Mutex<Vec<(u64, u32)>>,
}

impl InitializationFeature {
    pub fn new(dev: Arc<Device>, heaps: Arc<HeapPool>) -> Self {
        let (meta, map) = {
            let mut session = dev.d_puids.write().unwrap();
            (
                session.add_component(),
                session.add_non_sparse_component(|| UNTRACKED_BLOCK),
            )
        };

        Self {
            if_dev: dev,
            if_heaps: heaps,
            if_gpu: Mutex::new(None),
            if_meta: meta,
            if_map: map,
            if_pending_maps: Mutex::new(Vec::new()),
            if_pending_clears: Mutex::new(Vec::new()),
            if_known_initialized: Mutex::new(HashSet::new()),
            if_inflight_writes: Mutex::new(Vec::new()),
        }
    }

    /// The buffers the streamer needs to expose through the shader
    /// data array: (PUID map, texel bitset)
    pub fn gpu_buffers(&self) -> Option<(vk::Buffer, vk::Buffer)> {
        let gpu = self.if_gpu.lock().unwrap();
        gpu.as_ref()
            .map(|state| (state.gs_map_buffer, state.gs_texel.buffer()))
    }

    /// Start tracking a resource
    ///
    /// Returns the failure code shaders will observe. Host-mapped
    /// resources and resources past the map capacity come back
    /// untracked instead of producing false reports.
    pub fn register_resource(
        &self,
        puid: &nb::Puid,
        info: TexelResourceInfo,
        mapped: bool,
    ) -> FailureCode {
        let raw = puid.get_raw_id() as u32;

        let code;
        let mut block = None;
        if mapped || (raw as u64) >= MAP_ENTRY_COUNT {
            code = FailureCode::Untracked;
        } else {
            let gpu = self.if_gpu.lock().unwrap();
            match gpu.as_ref() {
                Some(state) => {
                    let b = state.gs_texel.allocate(&info);
                    code = b.failure_code;
                    if b.base_block_index != UNTRACKED_BLOCK {
                        self.if_map.set(puid, b.base_block_index);
                        self.if_pending_maps
                            .lock()
                            .unwrap()
                            .push((raw, b.base_block_index));
                        if code == FailureCode::MetadataRequiresClear {
                            self.if_pending_clears.lock().unwrap().push((raw, b));
                        }
                        block = Some(b);
                    }
                }
                // Feature not yet activated, nothing to point shaders at
                None => code = FailureCode::Untracked,
            }
        }

        self.if_meta.set(
            puid,
            InitAllocation {
                info: info,
                block: block,
                mapped: mapped,
                failure_code: code,
                pending_whole_blit: false,
            },
        );
        code
    }

    /// Release a resource's metadata
    pub fn unregister_resource(&self, puid: &nb::Puid) {
        let raw = puid.get_raw_id() as u32;
        if let Some(meta) = self.if_meta.take(puid) {
            if let Some(block) = meta.block {
                let gpu = self.if_gpu.lock().unwrap();
                if let Some(state) = gpu.as_ref() {
                    state.gs_texel.free(&block);
                }
            }
        }
        self.if_map.set(puid, UNTRACKED_BLOCK);
        self.if_pending_maps
            .lock()
            .unwrap()
            .push((raw, UNTRACKED_BLOCK));
        self.if_known_initialized.lock().unwrap().remove(&raw);
    }

    /// An intercepted API write covered `[first_texel, first_texel +
    /// count)` of the resource
    ///
    /// Records a mask blit over the covering words. Edge bits of a
    /// partially covered word are set too: the tradeoff is a missed
    /// report at a 32-texel boundary over a false positive.
    pub fn on_resource_write(
        &self,
        cmd: vk::CommandBuffer,
        puid: &nb::Puid,
        first_texel: u64,
        count: u64,
        submit_point: u64,
    ) {
        let raw = puid.get_raw_id() as u32;
        let meta = match self.if_meta.get_clone(puid) {
            Some(m) => m,
            None => return,
        };
        let block = match meta.block {
            Some(b) => b,
            None => return,
        };

        let gpu = self.if_gpu.lock().unwrap();
        let state = match gpu.as_ref() {
            Some(s) => s,
            None => return,
        };

        let (first_word, _) = block.bit_address(first_texel);
        let (last_word, _) = block.bit_address((first_texel + count).saturating_sub(1).max(first_texel));
        let word_count = last_word - first_word + 1;
        state
            .gs_kernels
            .record_fill(cmd, first_word, word_count, !0u32);

        if first_texel == 0 && count >= block.texel_count {
            if let Some(mut meta) = self.if_meta.get_mut(puid) {
                meta.pending_whole_blit = true;
            }
            self.if_inflight_writes
                .lock()
                .unwrap()
                .push((submit_point, raw));
        }
    }

    /// An intercepted copy between two tracked resources
    pub fn on_resource_copy(
        &self,
        cmd: vk::CommandBuffer,
        variant: CopyVariant,
        src: &nb::Puid,
        dst: &nb::Puid,
        src_texel: u64,
        dst_texel: u64,
        count: u64,
        submit_point: u64,
    ) {
        let src_block = match self.if_meta.get_clone(src).and_then(|m| m.block) {
            Some(b) => b,
            // Copies out of untracked sources conservatively mark the
            // destination written, the source contents are unknowable
            None => {
                self.on_resource_write(cmd, dst, dst_texel, count, submit_point);
                return;
            }
        };
        let dst_block = match self.if_meta.get_clone(dst).and_then(|m| m.block) {
            Some(b) => b,
            None => return,
        };

        let gpu = self.if_gpu.lock().unwrap();
        let state = match gpu.as_ref() {
            Some(s) => s,
            None => return,
        };

        let (src_word, _) = src_block.bit_address(src_texel);
        let (dst_word, _) = dst_block.bit_address(dst_texel);
        let bits = (count + src_block.granularity as u64 - 1) / src_block.granularity as u64;
        let words = ((bits + 31) / 32) as u32;
        state
            .gs_kernels
            .record_copy(cmd, variant, src_word, dst_word, words);
    }

    /// Map entries to push to the device before the next submission
    fn drain_map_uploads(&self) -> Vec<PendingUpload> {
        let pending: Vec<(u32, u32)> = self.if_pending_maps.lock().unwrap().drain(..).collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let gpu = self.if_gpu.lock().unwrap();
        let map_buffer = match gpu.as_ref() {
            Some(state) => state.gs_map_buffer,
            None => return Vec::new(),
        };

        // Coalesce into contiguous runs so each becomes one update
        let mut sorted = pending;
        sorted.sort_by_key(|(puid, _)| *puid);
        sorted.dedup_by_key(|(puid, _)| *puid);

        let mut uploads: Vec<PendingUpload> = Vec::new();
        for (puid, base) in sorted {
            match uploads.last_mut() {
                Some(last)
                    if last.word_offset + last.words.len() as u64 == puid as u64 =>
                {
                    last.words.push(base);
                }
                _ => uploads.push(PendingUpload {
                    buffer: map_buffer,
                    word_offset: puid as u64,
                    words: vec![base],
                }),
            }
        }
        uploads
    }

    pub(crate) fn has_pending_clears(&self) -> bool {
        !self.if_pending_clears.lock().unwrap().is_empty()
    }

    /// Record the queued metadata clears
    ///
    /// Returns false when there was nothing to record. The failure
    /// code transition to Ok is applied through the PRMT refresh the
    /// glue performs once the clear's timeline point lands.
    pub(crate) fn record_pending_clears(&self, cmd: vk::CommandBuffer) -> bool {
        let pending: Vec<(u32, TexelMemoryBlock)> =
            self.if_pending_clears.lock().unwrap().drain(..).collect();
        if pending.is_empty() {
            return false;
        }

        let gpu = self.if_gpu.lock().unwrap();
        let state = match gpu.as_ref() {
            Some(s) => s,
            None => return false,
        };

        for (puid, block) in pending.iter() {
            state
                .gs_kernels
                .record_fill(cmd, block.base_block_index, block.word_count, 0);
            log::verbose!("metadata clear recorded for puid {}", puid);
        }
        true
    }

    /// Promote whole-resource writes whose submissions have retired
    pub fn retire_submissions(&self, completed_point: u64) {
        let mut inflight = self.if_inflight_writes.lock().unwrap();
        let mut known = self.if_known_initialized.lock().unwrap();
        inflight.retain(|(point, puid)| {
            if *point <= completed_point {
                known.insert(*puid);
                false
            } else {
                true
            }
        });
    }

    pub fn is_known_initialized(&self, puid: u32) -> bool {
        self.if_known_initialized.lock().unwrap().contains(&puid)
    }
}

impl Feature for InitializationFeature {
    fn name(&self) -> &'static str {
        "initialization"
    }

    fn bit(&self) -> u64 {
        FeatureSet::INITIALIZATION.bits()
    }

    fn message_uid(&self) -> MessageUid {
        MessageUid::UninitializedResource
    }

    fn on_instrumentation(&self) -> Result<()> {
        let mut gpu = self.if_gpu.lock().unwrap();
        if gpu.is_some() {
            return Ok(());
        }

        let texel = TexelAllocator::new(self.if_dev.clone(), self.if_heaps.clone())?;

        let map_bytes = MAP_ENTRY_COUNT * 4;
        let (map_buffer, reqs) = self.if_dev.create_unbound_buffer(
            map_bytes,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let map_binding = self
            .if_heaps
            .allocate(MemClass::DeviceLocal, reqs.alignment, reqs.size)?;
        self.if_heaps.bind_buffer(map_buffer, &map_binding)?;

        let kernels = MaskKernels::new(self.if_dev.clone(), texel.buffer())?;

        *gpu = Some(GpuState {
            gs_texel: texel,
            gs_kernels: kernels,
            gs_map_buffer: map_buffer,
            gs_map_binding: map_binding,
        });

        // Replay every resource registered before activation
        let mut pending = self.if_pending_maps.lock().unwrap();
        let map = self.if_map.get_data_slice();
        for (puid, base) in map.data().iter().enumerate() {
            if *base != UNTRACKED_BLOCK {
                pending.push((puid as u32, *base));
            }
        }

        Ok(())
    }

    fn on_commit(&self) {}

    fn on_deactivate(&self) {
        let state = self.if_gpu.lock().unwrap().take();
        if let Some(state) = state {
            unsafe {
                self.if_dev
                    .dev
                    .destroy_buffer(state.gs_map_buffer, None)
            };
            self.if_heaps.free(&state.gs_map_binding);
            // TexelAllocator and MaskKernels release in their Drops
        }
    }

    fn build_pass(&self, shader_hash: u64) -> Box<dyn InjectionPass> {
        injection_pass(shader_hash)
    }

    fn command_hooks(&self) -> CommandHooks {
        CommandHooks::COPY
            | CommandHooks::CLEAR
            | CommandHooks::RESOLVE
            | CommandHooks::RENDER_PASS_STORE
    }

    fn drain_uploads(&self) -> Vec<PendingUpload> {
        self.drain_map_uploads()
    }

    fn handle_message(
        &self,
        msg: GpuMessage,
        report: &Mutex<Report>,
        out: &Mutex<Vec<FeatureReport>>,
    ) {
        let (puid, code, offset) = unpack_uninitialized(msg);

        // Failure-coded messages are the shader telling us it could
        // not validate, not that the application misbehaved
        if code != FailureCode::Ok {
            report.lock().unwrap().suppressed_untracked += 1;
            return;
        }
        // The write may have happened through a path we only learned
        // about at submission retirement
        if self.is_known_initialized(puid) {
            report.lock().unwrap().suppressed_untracked += 1;
            return;
        }

        report.lock().unwrap().uninitialized_reports += 1;
        out.lock().unwrap().push(FeatureReport::Uninitialized {
            puid: puid,
            code: code,
            offset: offset,
            truncated: offset == INIT_DETAIL_MAX,
        });
    }
}

/// Build the initialization rewrite pass by itself
///
/// The pass carries no host state past the shader's hash, so
/// rewrite-only consumers can run it without the feature.
pub(crate) fn injection_pass(shader_hash: u64) -> Box<dyn InjectionPass> {
    Box::new(InitializationPass {
        ip_shader_hash: shader_hash,
        ip_var_bindings: FxHashMap::default(),
        ip_chains: FxHashMap::default(),
    })
}

/// The initialization injection pass
///
/// For every load through a decorated resource variable it emits a
/// bitset probe ahead of the access and a guarded message export on a
/// miss; for every store it emits the atomic bit marking. Accesses
/// whose element index cannot be recovered from a local access chain
/// are left alone rather than guessed at.
struct InitializationPass {
    #[allow(dead_code)]
    ip_shader_hash: u64,
    /// variable id -> (descriptor set, binding)
    ip_var_bindings: FxHashMap<u32, (u32, u32)>,
    /// access chain result -> (base variable, final index id)
    ip_chains: FxHashMap<u32, (u32, u32)>,
}

impl InitializationPass {
    /// The probe shared by the load and store paths
    ///
    /// Returns (words, tracked_cond, miss_cond, safe_word_idx, bit).
    fn emit_probe(
        &self,
        block: &mut Block,
        set: u32,
        binding: u32,
        texel_id: u32,
    ) -> (Vec<u32>, u32, u32, u32, u32) {
        let b = block.emit();
        let u32t = b.type_u32();
        let boolt = b.type_bool();

        let mut w = Vec::new();

        // PRMT word: puid | failure
        let prmt_idx = b.const_u32(set * PRMT_BINDINGS_PER_SET + binding);
        let prmt_word = b.emit_prmt_load(&mut w, prmt_idx);
        let puid_mask = b.const_u32((1 << 26) - 1);
        let puid = b.emit_binop(&mut w, Op::BitwiseAnd, u32t, prmt_word, puid_mask);
        let c26 = b.const_u32(26);
        let fail_raw = b.emit_binop(&mut w, Op::ShiftRightLogical, u32t, prmt_word, c26);
        let c3 = b.const_u32(3);
        let failure = b.emit_binop(&mut w, Op::BitwiseAnd, u32t, fail_raw, c3);

        // Base block, untracked guard
        let base = b.emit_shader_data_load(&mut w, 0, puid);
        let untracked_c = b.const_u32(u32::MAX);
        let untracked = b.emit_binop(&mut w, Op::IEqual, boolt, base, untracked_c);

        // Covering word and bit
        let c5 = b.const_u32(5);
        let c31 = b.const_u32(31);
        let c0 = b.const_u32(0);
        let c1 = b.const_u32(1);
        let word_off = b.emit_binop(&mut w, Op::ShiftRightLogical, u32t, texel_id, c5);
        let word_idx = b.emit_binop(&mut w, Op::IAdd, u32t, base, word_off);
        let word_safe = b.emit_select(&mut w, u32t, untracked, c0, word_idx);
        let bit_off = b.emit_binop(&mut w, Op::BitwiseAnd, u32t, texel_id, c31);
        let bit = b.emit_binop(&mut w, Op::ShiftLeftLogical, u32t, c1, bit_off);

        // Probe
        let wordv = b.emit_shader_data_load(&mut w, 1, word_safe);
        let masked = b.emit_binop(&mut w, Op::BitwiseAnd, u32t, wordv, bit);
        let covered = b.emit_binop(&mut w, Op::IEqual, boolt, masked, bit);
        let uncovered = b.emit_unop(&mut w, Op::LogicalNot, boolt, covered);
        let fail_nz = b.emit_binop(&mut w, Op::INotEqual, boolt, failure, c0);
        let miss = b.emit_binop(&mut w, Op::LogicalOr, boolt, uncovered, fail_nz);

        let tracked = b.emit_unop(&mut w, Op::LogicalNot, boolt, untracked);

        // Pack the message while the operands are handy: payload =
        // puid << 30 | failure << 28 | min(texel, detail max)
        (w, tracked, miss, word_safe, bit)
    }

    fn emit_report(
        &self,
        block: &mut Block,
        words: &mut Vec<u32>,
        set: u32,
        binding: u32,
        texel_id: u32,
        miss: u32,
    ) {
        let b = block.emit();
        let u32t = b.type_u32();
        let u64t = b.type_u64();

        let prmt_idx = b.const_u32(set * PRMT_BINDINGS_PER_SET + binding);
        let prmt_word = b.emit_prmt_load(words, prmt_idx);
        let puid_mask = b.const_u32((1 << 26) - 1);
        let puid = b.emit_binop(words, Op::BitwiseAnd, u32t, prmt_word, puid_mask);
        let c26 = b.const_u32(26);
        let fail_raw = b.emit_binop(words, Op::ShiftRightLogical, u32t, prmt_word, c26);
        let c3 = b.const_u32(3);
        let failure = b.emit_binop(words, Op::BitwiseAnd, u32t, fail_raw, c3);

        let detail_max = b.const_u32(INIT_DETAIL_MAX as u32);
        let det = b.emit_umin(words, u32t, texel_id, detail_max);

        let puid64 = b.emit_unop(words, Op::UConvert, u64t, puid);
        let c30 = b.const_u32(30);
        let puid_sh = b.emit_binop(words, Op::ShiftLeftLogical, u64t, puid64, c30);
        let fail64 = b.emit_unop(words, Op::UConvert, u64t, failure);
        let c28 = b.const_u32(28);
        let fail_sh = b.emit_binop(words, Op::ShiftLeftLogical, u64t, fail64, c28);
        let det64 = b.emit_unop(words, Op::UConvert, u64t, det);

        let uid_bits = b.const_u64((MessageUid::UninitializedResource as u64) << 56);
        let or1 = b.emit_binop(words, Op::BitwiseOr, u64t, puid_sh, fail_sh);
        let or2 = b.emit_binop(words, Op::BitwiseOr, u64t, or1, det64);
        let msg = b.emit_binop(words, Op::BitwiseOr, u64t, or2, uid_bits);

        let export = b.emit_message_export(msg);
        let guarded = b.emit_guarded(miss, export);
        words.extend_from_slice(&guarded);
    }
}

impl InjectionPass for InitializationPass {
    fn name(&self) -> &'static str {
        "initialization"
    }

    fn prepare(&mut self, module: &Module) {
        // Pair up DescriptorSet / Binding decorations per variable
        let mut sets: FxHashMap<u32, u32> = FxHashMap::default();
        let mut bindings: FxHashMap<u32, u32> = FxHashMap::default();

        for inst in module.instructions() {
            if inst.opcode == Op::Decorate as u16 {
                let ops = module.operands(&inst);
                if ops.len() == 3 {
                    if ops[1] == spirv_headers::Decoration::DescriptorSet as u32 {
                        sets.insert(ops[0], ops[2]);
                    } else if ops[1] == spirv_headers::Decoration::Binding as u32 {
                        bindings.insert(ops[0], ops[2]);
                    }
                }
            } else if inst.opcode == Op::AccessChain as u16 {
                let ops = module.operands(&inst);
                // [type, result, base, indices...]
                if ops.len() >= 4 {
                    self.ip_chains
                        .insert(ops[1], (ops[2], *ops.last().unwrap()));
                }
            }
        }

        for (var, set) in sets {
            if let Some(binding) = bindings.get(&var) {
                self.ip_var_bindings.insert(var, (set, *binding));
            }
        }
    }

    fn visit_block(&mut self, block: &mut Block) -> bool {
        let mut targets: Vec<(crate::spv::InstRef, bool, u32, u32, u32)> = Vec::new();

        for inst in block.instructions() {
            let (pointer, is_store) = if inst.opcode == Op::Load as u16 {
                let ops = block.operands(inst);
                if ops.len() < 3 {
                    continue;
                }
                (ops[2], false)
            } else if inst.opcode == Op::Store as u16 {
                let ops = block.operands(inst);
                if ops.len() < 2 {
                    continue;
                }
                (ops[0], true)
            } else {
                continue;
            };

            let (base_var, index_id) = match self.ip_chains.get(&pointer) {
                Some(chain) => *chain,
                None => continue,
            };
            let (set, binding) = match self.ip_var_bindings.get(&base_var) {
                Some(sb) => *sb,
                None => continue,
            };

            targets.push((*inst, is_store, set, binding, index_id));
        }

        let modified = !targets.is_empty();
        for (inst, is_store, set, binding, index_id) in targets {
            let (mut words, tracked, miss, word_safe, bit) =
                self.emit_probe(block, set, binding, index_id);

            if is_store {
                // Mark the covered range written; untracked resources
                // skip the write entirely
                let mark = {
                    let b = block.emit();
                    let mut mark = Vec::new();
                    b.emit_shader_data_atomic_or(&mut mark, 1, word_safe, bit);
                    let guarded = b.emit_guarded(tracked, mark);
                    guarded
                };
                words.extend_from_slice(&mark);
            } else {
                self.emit_report(block, &mut words, set, binding, index_id, miss);
            }

            block.insert_before(&inst, words);
        }

        modified
    }
}
