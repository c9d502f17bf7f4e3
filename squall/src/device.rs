// Vulkan device representation
//
// This stores per-GPU state for one validated device session: the
// logical device, the queues the engine schedules its own work on,
// and the timelines used to order metadata uploads against the
// application's submissions.
//
// Austin Shafer - 2025

use ash::vk;
use niebla as nb;

extern crate utils as sq_utils;
use crate::deletion_queue::DeletionQueue;
use crate::instance::Instance;
use crate::{Result, SquallError};
use sq_utils::log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Squall Device
///
/// This holds all of the Vulkan logic for one GPU session. The device
/// is passed explicitly through every engine call, there is no global
/// dispatch table keyed off an opaque handle.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device backing this session
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) pdev_props: vk::PhysicalDeviceProperties,
    /// Queue family indices: (graphics, compute, transfer)
    pub(crate) d_graphics_family: u32,
    pub(crate) d_compute_family: u32,
    pub(crate) d_transfer_family: u32,
    /// Set once an INCONSISTENT_API class failure is observed. All
    /// instrumented paths bail once this is raised.
    d_dead: AtomicBool,
    /// The id mint for this session. Every long lived resource the
    /// layer tracks gets one of these ids, and the id is the join key
    /// into the GPU-visible metadata tables.
    pub d_puids: RwLock<nb::Session>,
    /// Externally synchronized and mutable state
    pub(crate) d_internal: Arc<RwLock<DeviceInternal>>,
}

/// Per-device state that needs to be externally synchronized
/// according to Vulkan, plus any mutable state.
pub struct DeviceInternal {
    /// queue for the engine's metadata uploads
    pub(crate) transfer_queue: vk::Queue,
    /// queue for the engine's mask blit and discard kernels
    pub(crate) compute_queue: vk::Queue,

    pub(crate) transfer_cmd_pool: vk::CommandPool,
    pub(crate) compute_cmd_pool: vk::CommandPool,

    /// The latest point on the graphics timeline. Application work
    /// submissions are tracked by this value.
    pub(crate) timeline_point: u64,
    /// The device's main timeline. Fence-equivalent: diagnostic
    /// streams are recycled and retired objects dropped once their
    /// recorded point has signaled here.
    pub(crate) timeline_sema: vk::Semaphore,

    /// Timeline for metadata uploads (PUID map drains). Application
    /// submissions wait on this so shaders never read a stale map.
    pub(crate) transfer_timeline_sema: vk::Semaphore,
    pub(crate) transfer_timeline_point: u64,

    /// Timeline for metadata clears on the compute queue. Only waited
    /// on when a freshly allocated resource needs its bitset
    /// discarded before first use.
    pub(crate) compute_timeline_sema: vk::Semaphore,
    pub(crate) compute_timeline_point: u64,
    /// The latest compute point we have already waited for
    pub(crate) latest_acked_compute_point: u64,

    /// Deletion queue
    /// This holds all data that will be dropped once the graphics
    /// timeline passes the recorded point
    pub(crate) deletion_queue: DeletionQueue,
}

impl Device {
    /// Create a logical device for interfacing with the physical device.
    ///
    /// The engine needs 64-bit atomics in shaders for the message
    /// counters, stores from every stage for the export streams, and
    /// timeline semaphores for its submission ordering.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queues: &[u32],
    ) -> ash::Device {
        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_int64(true)
            .vertex_pipeline_stores_and_atomics(true)
            .fragment_stores_and_atomics(true)
            .build();
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .build();

        // one priority per queue family, we only take one queue from each
        let priorities = [1.0];
        let mut queue_infos = Vec::new();
        for i in queues {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*i)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let devinfo_builder = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_ref())
            .enabled_features(&features)
            .push_next(&mut vulkan12_features);

        let dev_create_info = devinfo_builder.build();
        unsafe { inst.create_device(pdev, &dev_create_info, None).unwrap() }
    }

    /// get the vkPhysicalDeviceMemoryProperties structure for a vkPhysicalDevice
    pub(crate) fn get_pdev_mem_properties(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        unsafe { inst.get_physical_device_memory_properties(pdev) }
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> u32 {
        // get the properties per queue family
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| match info.queue_flags.contains(flags) {
                true => Some(index as u32),
                false => None,
            })
            .nth(0)
            .expect("Could not find a suitable queue family")
    }

    /// Choose a vkPhysicalDevice
    pub(crate) fn select_pdev(inst: &ash::Instance) -> vk::PhysicalDevice {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .expect("Physical device error")
        };

        // for now we are just going to get the first one
        *pdevices.iter().nth(0).expect("Couldn't find suitable device.")
    }

    /// Create a new default Device
    ///
    /// This creates a new device for the default chosen physical device
    /// in the Instance.
    pub fn new(instance: Arc<Instance>) -> Result<Self> {
        let pdev = Self::select_pdev(&instance.inst);

        let graphics_family = Self::select_queue_family(
            &instance.inst,
            pdev,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        );
        let compute_family = Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::COMPUTE);
        let transfer_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::TRANSFER);
        let mem_props = Self::get_pdev_mem_properties(&instance.inst, pdev);
        let pdev_props = unsafe { instance.inst.get_physical_device_properties(pdev) };

        // Dedup the family list, the driver rejects duplicate
        // queue create infos
        let mut families = vec![graphics_family];
        for fam in [compute_family, transfer_family] {
            if !families.contains(&fam) {
                families.push(fam);
            }
        }

        let dev = Self::create_device(&instance.inst, pdev, families.as_slice());

        let transfer_queue = unsafe { dev.get_device_queue(transfer_family, 0) };
        let compute_queue = unsafe { dev.get_device_queue(compute_family, 0) };

        // make our timeline semaphores
        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0)
            .build();
        let sema_create_info = vk::SemaphoreCreateInfo::builder()
            .push_next(&mut timeline_info)
            .build();
        let timeline_sema = unsafe {
            dev.create_semaphore(&sema_create_info, None)
                .or(Err(SquallError::INVALID))?
        };
        let transfer_timeline_sema = unsafe {
            dev.create_semaphore(&sema_create_info, None)
                .or(Err(SquallError::INVALID))?
        };
        let compute_timeline_sema = unsafe {
            dev.create_semaphore(&sema_create_info, None)
                .or(Err(SquallError::INVALID))?
        };

        let ret = Self {
            inst: instance,
            dev: dev,
            pdev: pdev,
            mem_props: mem_props,
            pdev_props: pdev_props,
            d_graphics_family: graphics_family,
            d_compute_family: compute_family,
            d_transfer_family: transfer_family,
            d_dead: AtomicBool::new(false),
            d_puids: RwLock::new(nb::Session::new()),
            d_internal: Arc::new(RwLock::new(DeviceInternal {
                transfer_queue: transfer_queue,
                compute_queue: compute_queue,
                transfer_cmd_pool: vk::CommandPool::null(),
                compute_cmd_pool: vk::CommandPool::null(),
                timeline_point: 0,
                timeline_sema: timeline_sema,
                transfer_timeline_sema: transfer_timeline_sema,
                transfer_timeline_point: 0,
                compute_timeline_sema: compute_timeline_sema,
                compute_timeline_point: 0,
                latest_acked_compute_point: 0,
                deletion_queue: DeletionQueue::new(),
            })),
        };

        {
            let transfer_cmd_pool = ret.create_command_pool(transfer_family);
            let compute_cmd_pool = ret.create_command_pool(compute_family);

            let mut internal = ret.d_internal.write().unwrap();
            internal.transfer_cmd_pool = transfer_cmd_pool;
            internal.compute_cmd_pool = compute_cmd_pool;
        }

        Ok(ret)
    }

    /// Mint a PUID for a newly tracked resource
    pub fn mint_puid(&self) -> Result<nb::Puid> {
        self.d_puids
            .write()
            .unwrap()
            .mint()
            .ok_or(SquallError::ID_SPACE_EXHAUSTED)
    }

    /// Has this session hit an unrecoverable driver inconsistency
    pub fn is_dead(&self) -> bool {
        self.d_dead.load(Ordering::Acquire)
    }

    /// Mark the session dead, instrumentation stops for good
    pub fn mark_dead(&self) {
        log::error!("device session marked dead, instrumentation is disabled");
        self.d_dead.store(true, Ordering::Release);
    }

    /// returns a new vkCommandPool for the given family
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> vk::CommandPool {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .unwrap()
        }
    }

    /// Allocate a vec of vkCommandBuffers
    ///
    /// Command buffer is shortened to `cbuf` in many areas of the code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .unwrap()
        }
    }

    /// Find a memory type index satisfying `flags` out of the
    /// physical device's heaps
    pub(crate) fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            if (type_bits & (1 << i)) != 0 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }

        None
    }

    /// Create an unbound buffer and report its requirements
    ///
    /// The heap pool owns binding it to suballocated memory.
    pub(crate) fn create_unbound_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::MemoryRequirements)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let buffer = unsafe {
            self.dev
                .create_buffer(&info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_BUFFER))?
        };
        let reqs = unsafe { self.dev.get_buffer_memory_requirements(buffer) };

        Ok((buffer, reqs))
    }

    /// Bump the graphics timeline and return the new point
    ///
    /// The caller signals this point with its submission.
    pub fn next_timeline_point(&self) -> u64 {
        let mut internal = self.d_internal.write().unwrap();
        internal.timeline_point += 1;
        internal.timeline_point
    }

    /// The last timeline point that has actually signaled on the device
    pub fn completed_timeline_point(&self) -> u64 {
        let internal = self.d_internal.read().unwrap();
        unsafe {
            self.dev
                .get_semaphore_counter_value(internal.timeline_sema)
                .unwrap_or(0)
        }
    }

    /// Retire deletion queue entries up to the signaled point
    pub fn reap_deletion_queue(&self) {
        let completed = self.completed_timeline_point();
        let mut internal = self.d_internal.write().unwrap();
        internal.deletion_queue.drop_all_at_point(completed);
    }

    /// Park an object until the graphics timeline passes `point`
    pub fn schedule_drop_at_point(
        &self,
        item: Box<dyn crate::Droppable + Send + Sync>,
        point: u64,
    ) {
        let mut internal = self.d_internal.write().unwrap();
        internal.deletion_queue.schedule_drop_at_point(item, point);
    }

    /// Wait for the compute (metadata clear) timeline
    ///
    /// If we have already waited for this point before then return and
    /// avoid the vkWaitSemaphores overhead.
    pub fn wait_for_metadata_clears(&self) -> Result<()> {
        let mut internal = self.d_internal.write().unwrap();

        if internal.latest_acked_compute_point >= internal.compute_timeline_point {
            return Ok(());
        }

        let wait_semas = &[internal.compute_timeline_sema];
        let wait_values = &[internal.compute_timeline_point];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(wait_semas)
            .values(wait_values)
            .build();

        unsafe {
            self.dev
                .wait_semaphores(&wait_info, u64::MAX)
                .or(Err(SquallError::TIMEOUT))?;
        }

        internal.latest_acked_compute_point = internal.compute_timeline_point;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();

            let mut internal = self.d_internal.write().unwrap();
            internal.deletion_queue.drain_all();
            self.dev.destroy_semaphore(internal.timeline_sema, None);
            self.dev
                .destroy_semaphore(internal.transfer_timeline_sema, None);
            self.dev
                .destroy_semaphore(internal.compute_timeline_sema, None);
            self.dev
                .destroy_command_pool(internal.transfer_cmd_pool, None);
            if internal.compute_cmd_pool != internal.transfer_cmd_pool {
                self.dev
                    .destroy_command_pool(internal.compute_cmd_pool, None);
            }
            drop(internal);

            self.dev.destroy_device(None);
        }
    }
}
