/*
 * An allocator for the diagnostic descriptor sets handed to
 * instrumented shaders
 *
 * Austin Shafer - 2025
 */

#![allow(dead_code)]

use ash::vk;

use crate::device::Device;
use crate::messages::{stream_buffer_size, STREAM_HEADER_SIZE};
use crate::{Result, SquallError};

use std::sync::Arc;

/// The default number of sets in each pool
static POOL_SIZE: u32 = 64;

// The shader-visible binding schema. The rewrite passes hard-code
// these slots, the streamer and the pool have to populate them in the
// same order.
/// Message counter, the header region of the stream buffer
pub const BINDING_COUNTER: u32 = 0;
/// The message slots of the stream buffer
pub const BINDING_STREAM: u32 = 1;
/// Physical resource mapping table
pub const BINDING_PRMT: u32 = 2;
/// Sampler mapping table
pub const BINDING_SAMPLER_PRMT: u32 = 3;
/// Runtime constants (event state, heap bounds)
pub const BINDING_CONSTANTS: u32 = 4;
/// Per-feature shader data array
pub const BINDING_SHADER_DATA: u32 = 5;
/// Entries in the shader data array binding
pub const SHADER_DATA_COUNT: u32 = 16;

/// One allocated diagnostic set and the pool it came from
#[derive(Debug, Copy, Clone)]
pub struct DiagDescriptor {
    pub set: vk::DescriptorSet,
    pub pool_index: usize,
}

/// A pool of descriptor pools
///
/// Sets for every in-flight diagnostic stream are allocated out of
/// here. Pool exhaustion is handled by growing a new pool, never by
/// failing the caller.
pub struct DescPool {
    dp_dev: Arc<Device>,
    /// the layout shared by every diagnostic set
    dp_layout: vk::DescriptorSetLayout,
    dp_pools: Vec<vk::DescriptorPool>,
    /// number of live sets in each pool, from 0 to POOL_SIZE
    dp_capacities: Vec<usize>,
}

impl DescPool {
    /// Create the diagnostic set layout
    ///
    /// The instrumented shaders find this set at one slot past the
    /// application's highest set index, with the bindings laid out
    /// exactly as the schema constants above.
    fn create_layout(dev: &Device) -> vk::DescriptorSetLayout {
        let stages = vk::ShaderStageFlags::ALL;
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_COUNTER)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(stages)
                .descriptor_count(1)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_STREAM)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(stages)
                .descriptor_count(1)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_PRMT)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(stages)
                .descriptor_count(1)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLER_PRMT)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(stages)
                .descriptor_count(1)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .stage_flags(stages)
                .descriptor_count(1)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SHADER_DATA)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(stages)
                .descriptor_count(SHADER_DATA_COUNT)
                .build(),
        ];

        let binding_flags = [vk::DescriptorBindingFlags::empty(),
            vk::DescriptorBindingFlags::empty(),
            vk::DescriptorBindingFlags::empty(),
            vk::DescriptorBindingFlags::empty(),
            vk::DescriptorBindingFlags::empty(),
            // features populate only the entries they own
            vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags)
            .build();

        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info);

        unsafe { dev.dev.create_descriptor_set_layout(&info, None).unwrap() }
    }

    /// Returns the index of the new pool
    fn add_pool(&mut self) -> usize {
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(POOL_SIZE * (4 + SHADER_DATA_COUNT))
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(POOL_SIZE)
                .build(),
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // we want to be able to free descriptor sets individually
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE);

        self.dp_pools.push(unsafe {
            self.dp_dev
                .dev
                .create_descriptor_pool(&info, None)
                .unwrap()
        });
        self.dp_capacities.push(0);

        return self.dp_pools.len() - 1;
    }

    pub fn new(dev: Arc<Device>) -> Result<DescPool> {
        let mut ret = DescPool {
            dp_layout: DescPool::create_layout(&dev),
            dp_dev: dev,
            dp_pools: Vec::new(),
            dp_capacities: Vec::new(),
        };

        // Add one default pool to begin with
        ret.add_pool();

        Ok(ret)
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.dp_layout
    }

    fn get_ideal_pool(&mut self) -> usize {
        for (i, cap) in self.dp_capacities.iter().enumerate() {
            if cap + 1 < POOL_SIZE as usize {
                return i;
            }
        }

        // No existing pool had room, so create a new one
        return self.add_pool();
    }

    /// Allocate one diagnostic descriptor set
    pub fn alloc_diag_set(&mut self) -> Result<DiagDescriptor> {
        let pool_index = self.get_ideal_pool();

        let layouts = [self.dp_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pools[pool_index])
            .set_layouts(&layouts)
            .build();

        let set = unsafe {
            self.dp_dev
                .dev
                .allocate_descriptor_sets(&info)
                .or(Err(SquallError::DESCRIPTOR_POOL_EXHAUSTED))?[0]
        };
        self.dp_capacities[pool_index] += 1;

        Ok(DiagDescriptor {
            set: set,
            pool_index: pool_index,
        })
    }

    pub fn free_set(&mut self, desc: DiagDescriptor) {
        assert!(desc.pool_index < self.dp_pools.len());

        unsafe {
            self.dp_dev
                .dev
                .free_descriptor_sets(self.dp_pools[desc.pool_index], &[desc.set])
                .unwrap();
        }
        self.dp_capacities[desc.pool_index] -= 1;
    }

    /// Point the counter and stream bindings at a stream buffer
    pub fn write_stream_buffer(&self, desc: &DiagDescriptor, buffer: vk::Buffer, capacity: u32) {
        let counter_info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(0)
            .range(STREAM_HEADER_SIZE)
            .build()];
        let stream_info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(STREAM_HEADER_SIZE)
            .range(stream_buffer_size(capacity) - STREAM_HEADER_SIZE)
            .build()];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(desc.set)
                .dst_binding(BINDING_COUNTER)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&counter_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(desc.set)
                .dst_binding(BINDING_STREAM)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&stream_info)
                .build(),
        ];
        unsafe { self.dp_dev.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Point the PRMT binding at the streamer's descriptor data chunk
    pub fn write_prmt(
        &self,
        desc: &DiagDescriptor,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(range)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(desc.set)
            .dst_binding(BINDING_PRMT)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&info)
            .build()];
        unsafe { self.dp_dev.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Point the constants binding at the per-command-buffer constant
    /// data
    pub fn write_constants(&self, desc: &DiagDescriptor, buffer: vk::Buffer, range: u64) {
        let info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(0)
            .range(range)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(desc.set)
            .dst_binding(BINDING_CONSTANTS)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info)
            .build()];
        unsafe { self.dp_dev.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Populate one entry of the per-feature shader data array
    pub fn write_shader_data(
        &self,
        desc: &DiagDescriptor,
        index: u32,
        buffer: vk::Buffer,
        range: u64,
    ) {
        assert!(index < SHADER_DATA_COUNT);
        let info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(0)
            .range(range)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(desc.set)
            .dst_binding(BINDING_SHADER_DATA)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&info)
            .build()];
        unsafe { self.dp_dev.dev.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for DescPool {
    fn drop(&mut self) {
        unsafe {
            for p in self.dp_pools.iter() {
                self.dp_dev.dev.destroy_descriptor_pool(*p, None);
            }
            self.dp_dev
                .dev
                .destroy_descriptor_set_layout(self.dp_layout, None);
        }
    }
}
