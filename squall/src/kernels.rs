// Metadata mask kernels
//
// Three small compute programs keep GPU-side state coherent with
// what actually happened on the device: a mask fill (writes a
// constant into a bitset span, all-ones for blits and clears, zero
// for discards), a mask copy (clones a source span onto a
// destination span, shared by the texel, buffer-placement, and
// volumetric copy variants whose addressing is linearized
// host-side), and a header snapshot (clamps a stream's counter into
// its transferred count at readback time).
//
// The kernels are tiny enough that we assemble their SPIR-V directly
// instead of shipping compiled blobs.
//
// Austin Shafer - 2025

use ash::vk;
use spirv_headers::{Op, StorageClass};

use crate::device::Device;
use crate::spv::{inst_word, SPIRV_MAGIC};
use crate::{Result, SquallError};

use std::ffi::CString;
use std::sync::Arc;

/// Threads per workgroup, must match the assembled LocalSize
pub const KERNEL_WORKGROUP: u32 = 64;

/// Which copy addressing produced the linearized ranges
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyVariant {
    Texel,
    BufferPlacement,
    Volumetric,
}

/// Push constant block for both kernels
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct MaskPush {
    /// Fill: first destination word. Copy: first source word.
    pub word_a: u32,
    /// Fill: word count. Copy: first destination word.
    pub word_b: u32,
    /// Fill: fill value. Copy: word count.
    pub word_c: u32,
}

struct Assembler {
    a_words: Vec<u32>,
    a_next_id: u32,
}

impl Assembler {
    fn new() -> Self {
        // version 1.3, zero generator, bound patched at finish
        Self {
            a_words: vec![SPIRV_MAGIC, 0x0001_0300, 0, 0, 0],
            a_next_id: 1,
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.a_next_id;
        self.a_next_id += 1;
        id
    }

    fn op(&mut self, op: Op, operands: &[u32]) {
        self.a_words.push(inst_word(op, 1 + operands.len()));
        self.a_words.extend_from_slice(operands);
    }

    fn finish(mut self) -> Vec<u32> {
        self.a_words[3] = self.a_next_id;
        self.a_words
    }
}

/// Assemble one mask kernel
///
/// Both kernels share the skeleton: bounds-check the invocation
/// index against the word count, then either store a constant or
/// copy a word within the global metadata buffer.
pub(crate) fn build_mask_kernel(copy: bool) -> Vec<u32> {
    let mut a = Assembler::new();

    let main_fn = a.id();
    let gid_var = a.id();

    a.op(Op::Capability, &[1]); // Shader
    a.op(Op::MemoryModel, &[0, 1]); // Logical GLSL450
    // "main"
    let name = u32::from_le_bytes(*b"main");
    a.op(Op::EntryPoint, &[5 /* GLCompute */, main_fn, name, 0, gid_var]);
    a.op(Op::ExecutionMode, &[main_fn, 17 /* LocalSize */, KERNEL_WORKGROUP, 1, 1]);

    // ---- types and globals ----
    let ty_void = a.id();
    let ty_fn = a.id();
    let ty_u32 = a.id();
    let ty_v3u32 = a.id();
    let ty_bool = a.id();
    let ptr_input_v3 = a.id();
    let ty_push = a.id();
    let ptr_push = a.id();
    let ptr_push_u32 = a.id();
    let ty_runtime = a.id();
    let ty_buf = a.id();
    let ptr_buf = a.id();
    let ptr_buf_u32 = a.id();
    let buf_var = a.id();
    let push_var = a.id();
    let c0 = a.id();
    let c1 = a.id();
    let c2 = a.id();

    // decorations first
    a.op(Op::Decorate, &[gid_var, 11 /* BuiltIn */, 28 /* GlobalInvocationId */]);
    a.op(Op::Decorate, &[ty_push, 2 /* Block */]);
    a.op(Op::MemberDecorate, &[ty_push, 0, 35 /* Offset */, 0]);
    a.op(Op::MemberDecorate, &[ty_push, 1, 35, 4]);
    a.op(Op::MemberDecorate, &[ty_push, 2, 35, 8]);
    a.op(Op::Decorate, &[ty_runtime, 6 /* ArrayStride */, 4]);
    a.op(Op::Decorate, &[ty_buf, 2 /* Block */]);
    a.op(Op::MemberDecorate, &[ty_buf, 0, 35, 0]);
    a.op(Op::Decorate, &[buf_var, 34 /* DescriptorSet */, 0]);
    a.op(Op::Decorate, &[buf_var, 33 /* Binding */, 0]);

    a.op(Op::TypeVoid, &[ty_void]);
    a.op(Op::TypeFunction, &[ty_fn, ty_void]);
    a.op(Op::TypeInt, &[ty_u32, 32, 0]);
    a.op(Op::TypeVector, &[ty_v3u32, ty_u32, 3]);
    a.op(Op::TypeBool, &[ty_bool]);
    a.op(Op::TypePointer, &[ptr_input_v3, StorageClass::Input as u32, ty_v3u32]);
    a.op(Op::TypeStruct, &[ty_push, ty_u32, ty_u32, ty_u32]);
    a.op(Op::TypePointer, &[ptr_push, StorageClass::PushConstant as u32, ty_push]);
    a.op(Op::TypePointer, &[ptr_push_u32, StorageClass::PushConstant as u32, ty_u32]);
    a.op(Op::TypeRuntimeArray, &[ty_runtime, ty_u32]);
    a.op(Op::TypeStruct, &[ty_buf, ty_runtime]);
    a.op(Op::TypePointer, &[ptr_buf, StorageClass::StorageBuffer as u32, ty_buf]);
    a.op(Op::TypePointer, &[ptr_buf_u32, StorageClass::StorageBuffer as u32, ty_u32]);
    a.op(Op::Variable, &[ptr_buf, buf_var, StorageClass::StorageBuffer as u32]);
    a.op(Op::Variable, &[ptr_push, push_var, StorageClass::PushConstant as u32]);
    a.op(Op::Variable, &[ptr_input_v3, gid_var, StorageClass::Input as u32]);
    a.op(Op::Constant, &[ty_u32, c0, 0]);
    a.op(Op::Constant, &[ty_u32, c1, 1]);
    a.op(Op::Constant, &[ty_u32, c2, 2]);

    // ---- main ----
    let entry = a.id();
    let gid3 = a.id();
    let gid = a.id();
    let count_ptr = a.id();
    let count = a.id();
    let in_range = a.id();
    let then_label = a.id();
    let merge_label = a.id();

    a.op(Op::Function, &[ty_void, main_fn, 0 /* None */, ty_fn]);
    a.op(Op::Label, &[entry]);
    a.op(Op::Load, &[ty_v3u32, gid3, gid_var]);
    a.op(Op::CompositeExtract, &[ty_u32, gid, gid3, 0]);
    // count lives in member 1 (fill) or member 2 (copy)
    let count_member = match copy {
        true => c2,
        false => c1,
    };
    a.op(Op::AccessChain, &[ptr_push_u32, count_ptr, push_var, count_member]);
    a.op(Op::Load, &[ty_u32, count, count_ptr]);
    a.op(Op::ULessThan, &[ty_bool, in_range, gid, count]);
    a.op(Op::SelectionMerge, &[merge_label, 0]);
    a.op(Op::BranchConditional, &[in_range, then_label, merge_label]);

    a.op(Op::Label, &[then_label]);
    if copy {
        // dst[word_b + gid] = src[word_a + gid]
        let src_base_ptr = a.id();
        let src_base = a.id();
        let dst_base_ptr = a.id();
        let dst_base = a.id();
        let src_idx = a.id();
        let dst_idx = a.id();
        let src_ptr = a.id();
        let val = a.id();
        let dst_ptr = a.id();

        a.op(Op::AccessChain, &[ptr_push_u32, src_base_ptr, push_var, c0]);
        a.op(Op::Load, &[ty_u32, src_base, src_base_ptr]);
        a.op(Op::AccessChain, &[ptr_push_u32, dst_base_ptr, push_var, c1]);
        a.op(Op::Load, &[ty_u32, dst_base, dst_base_ptr]);
        a.op(Op::IAdd, &[ty_u32, src_idx, src_base, gid]);
        a.op(Op::IAdd, &[ty_u32, dst_idx, dst_base, gid]);
        a.op(Op::AccessChain, &[ptr_buf_u32, src_ptr, buf_var, c0, src_idx]);
        a.op(Op::Load, &[ty_u32, val, src_ptr]);
        a.op(Op::AccessChain, &[ptr_buf_u32, dst_ptr, buf_var, c0, dst_idx]);
        a.op(Op::Store, &[dst_ptr, val]);
    } else {
        // dst[word_a + gid] = value
        let base_ptr = a.id();
        let base = a.id();
        let value_ptr = a.id();
        let value = a.id();
        let idx = a.id();
        let dst_ptr = a.id();

        a.op(Op::AccessChain, &[ptr_push_u32, base_ptr, push_var, c0]);
        a.op(Op::Load, &[ty_u32, base, base_ptr]);
        a.op(Op::AccessChain, &[ptr_push_u32, value_ptr, push_var, c2]);
        a.op(Op::Load, &[ty_u32, value, value_ptr]);
        a.op(Op::IAdd, &[ty_u32, idx, base, gid]);
        a.op(Op::AccessChain, &[ptr_buf_u32, dst_ptr, buf_var, c0, idx]);
        a.op(Op::Store, &[dst_ptr, value]);
    }
    a.op(Op::Branch, &[merge_label]);

    a.op(Op::Label, &[merge_label]);
    a.op(Op::Return, &[]);
    a.op(Op::FunctionEnd, &[]);

    a.finish()
}

/// Assemble the stream header snapshot kernel
///
/// A single invocation reading the stream header bound at (set 0,
/// binding 0): `transferred_count = min(written_count, capacity)`.
/// The shader-side counter is bumped without a cap so overflow stays
/// observable, but the transferred count must only ever claim what
/// the stream actually stored.
pub(crate) fn build_header_snapshot_kernel() -> Vec<u32> {
    let mut a = Assembler::new();

    let main_fn = a.id();

    a.op(Op::Capability, &[1]); // Shader
    a.op(Op::MemoryModel, &[0, 1]); // Logical GLSL450
    let name = u32::from_le_bytes(*b"main");
    a.op(Op::EntryPoint, &[5 /* GLCompute */, main_fn, name, 0]);
    a.op(Op::ExecutionMode, &[main_fn, 17 /* LocalSize */, 1, 1, 1]);

    // ---- types and globals ----
    let ty_void = a.id();
    let ty_fn = a.id();
    let ty_u32 = a.id();
    let ty_bool = a.id();
    let ty_header = a.id();
    let ptr_header = a.id();
    let ptr_u32 = a.id();
    let hdr_var = a.id();
    let c0 = a.id();
    let c1 = a.id();
    let c3 = a.id();

    // struct { u32 written; u32 capacity; u32 cookie; u32 transferred }
    a.op(Op::Decorate, &[ty_header, 2 /* Block */]);
    for member in 0..4u32 {
        a.op(Op::MemberDecorate, &[ty_header, member, 35 /* Offset */, member * 4]);
    }
    a.op(Op::Decorate, &[hdr_var, 34 /* DescriptorSet */, 0]);
    a.op(Op::Decorate, &[hdr_var, 33 /* Binding */, 0]);

    a.op(Op::TypeVoid, &[ty_void]);
    a.op(Op::TypeFunction, &[ty_fn, ty_void]);
    a.op(Op::TypeInt, &[ty_u32, 32, 0]);
    a.op(Op::TypeBool, &[ty_bool]);
    a.op(Op::TypeStruct, &[ty_header, ty_u32, ty_u32, ty_u32, ty_u32]);
    a.op(Op::TypePointer, &[ptr_header, StorageClass::StorageBuffer as u32, ty_header]);
    a.op(Op::TypePointer, &[ptr_u32, StorageClass::StorageBuffer as u32, ty_u32]);
    a.op(Op::Variable, &[ptr_header, hdr_var, StorageClass::StorageBuffer as u32]);
    a.op(Op::Constant, &[ty_u32, c0, 0]);
    a.op(Op::Constant, &[ty_u32, c1, 1]);
    a.op(Op::Constant, &[ty_u32, c3, 3]);

    // ---- main ----
    let entry = a.id();
    let written_ptr = a.id();
    let written = a.id();
    let cap_ptr = a.id();
    let cap = a.id();
    let in_range = a.id();
    let clamped = a.id();
    let transferred_ptr = a.id();

    a.op(Op::Function, &[ty_void, main_fn, 0 /* None */, ty_fn]);
    a.op(Op::Label, &[entry]);
    a.op(Op::AccessChain, &[ptr_u32, written_ptr, hdr_var, c0]);
    a.op(Op::Load, &[ty_u32, written, written_ptr]);
    a.op(Op::AccessChain, &[ptr_u32, cap_ptr, hdr_var, c1]);
    a.op(Op::Load, &[ty_u32, cap, cap_ptr]);
    a.op(Op::ULessThan, &[ty_bool, in_range, written, cap]);
    a.op(Op::Select, &[ty_u32, clamped, in_range, written, cap]);
    a.op(Op::AccessChain, &[ptr_u32, transferred_ptr, hdr_var, c3]);
    a.op(Op::Store, &[transferred_ptr, clamped]);
    a.op(Op::Return, &[]);
    a.op(Op::FunctionEnd, &[]);

    a.finish()
}

/// One compute kernel and its fixed-function state
struct Pass {
    p_pipeline: vk::Pipeline,
    p_pipeline_layout: vk::PipelineLayout,
    p_descriptor_layout: vk::DescriptorSetLayout,
    p_shader_module: vk::ShaderModule,
    p_desc_pool: vk::DescriptorPool,
    p_descs: vk::DescriptorSet,
}

impl Pass {
    fn destroy(&mut self, dev: &Device) {
        unsafe {
            dev.dev
                .destroy_descriptor_set_layout(self.p_descriptor_layout, None);
            dev.dev.destroy_descriptor_pool(self.p_desc_pool, None);
            dev.dev
                .destroy_pipeline_layout(self.p_pipeline_layout, None);
            dev.dev.destroy_shader_module(self.p_shader_module, None);
            dev.dev.destroy_pipeline(self.p_pipeline, None);
        }
    }
}

/// The mask fill and mask copy pipelines for one device
pub struct MaskKernels {
    mk_dev: Arc<Device>,
    mk_fill: Pass,
    mk_copy: Pass,
}

impl MaskKernels {
    fn create_descriptor_layout(dev: &Device) -> vk::DescriptorSetLayout {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .descriptor_count(1)
            .build()];
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .build();

        unsafe { dev.dev.create_descriptor_set_layout(&info, None).unwrap() }
    }

    fn create_pass(dev: &Device, metadata_buffer: vk::Buffer, copy: bool) -> Result<Pass> {
        let layout = Self::create_descriptor_layout(dev);

        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .build()];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);
        let pool = unsafe { dev.dev.create_descriptor_pool(&pool_info, None).unwrap() };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();
        let descs = unsafe { dev.dev.allocate_descriptor_sets(&alloc_info).unwrap()[0] };

        // The kernels only ever see the global metadata buffer
        let buf_info = [vk::DescriptorBufferInfo::builder()
            .buffer(metadata_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(descs)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buf_info)
            .build()];
        unsafe { dev.dev.update_descriptor_sets(&writes, &[]) };

        let words = build_mask_kernel(copy);
        let module_info = vk::ShaderModuleCreateInfo::builder().code(&words).build();
        let module = unsafe {
            dev.dev
                .create_shader_module(&module_info, None)
                .or(Err(SquallError::COMPILE_FAILED))?
        };

        let push_range = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<MaskPush>() as u32)
            .build()];
        let set_layouts = [layout];
        let pipe_layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_range)
            .build();
        let pipe_layout = unsafe {
            dev.dev
                .create_pipeline_layout(&pipe_layout_info, None)
                .unwrap()
        };

        let entrypoint = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entrypoint)
            .build();
        let pipe_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipe_layout)
            .build();
        let pipeline = unsafe {
            dev.dev
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipe_info], None)
                .or(Err(SquallError::COULD_NOT_CREATE_PIPELINE))?[0]
        };

        Ok(Pass {
            p_pipeline: pipeline,
            p_pipeline_layout: pipe_layout,
            p_descriptor_layout: layout,
            p_shader_module: module,
            p_desc_pool: pool,
            p_descs: descs,
        })
    }

    pub fn new(dev: Arc<Device>, metadata_buffer: vk::Buffer) -> Result<Self> {
        let fill = Self::create_pass(&dev, metadata_buffer, false)?;
        let copy = Self::create_pass(&dev, metadata_buffer, true)?;

        Ok(Self {
            mk_dev: dev,
            mk_fill: fill,
            mk_copy: copy,
        })
    }

    fn dispatch(&self, cmd: vk::CommandBuffer, pass: &Pass, push: &MaskPush, words: u32) {
        let bytes = unsafe {
            std::slice::from_raw_parts(
                push as *const MaskPush as *const u8,
                std::mem::size_of::<MaskPush>(),
            )
        };
        unsafe {
            self.mk_dev.dev.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pass.p_pipeline,
            );
            self.mk_dev.dev.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pass.p_pipeline_layout,
                0,
                &[pass.p_descs],
                &[],
            );
            self.mk_dev.dev.cmd_push_constants(
                cmd,
                pass.p_pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytes,
            );
            self.mk_dev.dev.cmd_dispatch(
                cmd,
                (words + KERNEL_WORKGROUP - 1) / KERNEL_WORKGROUP,
                1,
                1,
            );
        }
    }

    /// Record a mask fill over `word_count` words starting at
    /// `base_word`
    pub fn record_fill(
        &self,
        cmd: vk::CommandBuffer,
        base_word: u32,
        word_count: u32,
        value: u32,
    ) {
        let push = MaskPush {
            word_a: base_word,
            word_b: word_count,
            word_c: value,
        };
        self.dispatch(cmd, &self.mk_fill, &push, word_count);
    }

    /// Record a mask copy between two spans of the metadata buffer
    ///
    /// All three API copy shapes funnel through here; the variant
    /// only drove the host-side linearization of the ranges.
    pub fn record_copy(
        &self,
        cmd: vk::CommandBuffer,
        _variant: CopyVariant,
        src_word: u32,
        dst_word: u32,
        word_count: u32,
    ) {
        let push = MaskPush {
            word_a: src_word,
            word_b: dst_word,
            word_c: word_count,
        };
        self.dispatch(cmd, &self.mk_copy, &push, word_count);
    }
}

impl Drop for MaskKernels {
    fn drop(&mut self) {
        let dev = self.mk_dev.clone();
        self.mk_fill.destroy(&dev);
        self.mk_copy.destroy(&dev);
    }
}

/// The stream header snapshot pipeline
///
/// Owned by the diagnostic pool. Its layout is the diagnostic set
/// layout itself, so each stream's own descriptor set binds straight
/// in and the kernel reaches the header through the counter binding.
pub(crate) struct HeaderSnapshot {
    hs_dev: Arc<Device>,
    hs_pipeline: vk::Pipeline,
    hs_pipeline_layout: vk::PipelineLayout,
    hs_shader_module: vk::ShaderModule,
}

impl HeaderSnapshot {
    pub(crate) fn new(dev: Arc<Device>, set_layout: vk::DescriptorSetLayout) -> Result<Self> {
        let words = build_header_snapshot_kernel();
        let module_info = vk::ShaderModuleCreateInfo::builder().code(&words).build();
        let module = unsafe {
            dev.dev
                .create_shader_module(&module_info, None)
                .or(Err(SquallError::COMPILE_FAILED))?
        };

        let set_layouts = [set_layout];
        let pipe_layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .build();
        let pipe_layout = unsafe {
            dev.dev
                .create_pipeline_layout(&pipe_layout_info, None)
                .unwrap()
        };

        let entrypoint = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entrypoint)
            .build();
        let pipe_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipe_layout)
            .build();
        let pipeline = unsafe {
            dev.dev
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipe_info], None)
                .or(Err(SquallError::COULD_NOT_CREATE_PIPELINE))?[0]
        };

        Ok(Self {
            hs_dev: dev,
            hs_pipeline: pipeline,
            hs_pipeline_layout: pipe_layout,
            hs_shader_module: module,
        })
    }

    /// Record the clamp against one stream's descriptor set
    pub(crate) fn record(&self, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        unsafe {
            self.hs_dev.dev.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.hs_pipeline,
            );
            self.hs_dev.dev.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.hs_pipeline_layout,
                0,
                &[set],
                &[],
            );
            self.hs_dev.dev.cmd_dispatch(cmd, 1, 1, 1);
        }
    }
}

impl Drop for HeaderSnapshot {
    fn drop(&mut self) {
        unsafe {
            self.hs_dev
                .dev
                .destroy_pipeline_layout(self.hs_pipeline_layout, None);
            self.hs_dev
                .dev
                .destroy_shader_module(self.hs_shader_module, None);
            self.hs_dev.dev.destroy_pipeline(self.hs_pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spv;

    #[test]
    fn kernels_assemble_to_valid_modules() {
        for copy in [false, true] {
            let words = build_mask_kernel(copy);
            let module = spv::Module::from_words(&words).unwrap();
            assert_eq!(module.version(), (1, 3));

            // Skeleton sanity: exactly one entry point, one function,
            // three blocks, and a bounds check
            let mut functions = 0;
            let mut labels = 0;
            let mut compares = 0;
            for inst in module.instructions() {
                if inst.opcode == spirv_headers::Op::Function as u16 {
                    functions += 1;
                } else if inst.opcode == spirv_headers::Op::Label as u16 {
                    labels += 1;
                } else if inst.opcode == spirv_headers::Op::ULessThan as u16 {
                    compares += 1;
                }
            }
            assert_eq!(functions, 1);
            assert_eq!(labels, 3);
            assert_eq!(compares, 1);
        }
    }

    #[test]
    fn snapshot_kernel_clamps_with_a_select() {
        let words = build_header_snapshot_kernel();
        let module = spv::Module::from_words(&words).unwrap();

        // Straight-line single block: compare, select, store, no
        // control flow
        let mut labels = 0;
        let mut selects = 0;
        let mut stores = 0;
        for inst in module.instructions() {
            if inst.opcode == spirv_headers::Op::Label as u16 {
                labels += 1;
            } else if inst.opcode == spirv_headers::Op::Select as u16 {
                selects += 1;
            } else if inst.opcode == spirv_headers::Op::Store as u16 {
                stores += 1;
            }
        }
        assert_eq!(labels, 1);
        assert_eq!(selects, 1);
        assert_eq!(stores, 1);
    }
}
