// GPU memory suballocation with owner-driven defragmentation
//
// The engine makes a lot of small, short-lived buffer allocations:
// message streams, mirrors, metadata tables, descriptor backing. Each
// memory class gets a list of chunked heaps and bindings are carved
// out of them. Freed spans are not coalesced eagerly. Instead a
// defragmentation pass marks the record after the largest empty span
// with a rebind request, and the owner of that binding moves it when
// it can tolerate recreating the underlying API object. The heap
// never rewrites a record behind its owner's back.
//
// Austin Shafer - 2025

use ash::vk;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::{CreateInfo, Result, SquallError};
use sq_utils::log;
use sq_utils::{align_up, partial_max};

use std::sync::{Arc, Mutex};

/// Which kind of memory a heap hands out
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemClass {
    DeviceLocal,
    HostVisible,
}

/// A sticky marker stating "this record wants to move to a lower
/// offset". While it is pending no new allocation may be placed in a
/// gap bordering the record, or the move target would be stolen out
/// from under it.
#[derive(Debug, Copy, Clone, Default)]
pub struct RebindRequest {
    pub requested: bool,
    pub target_offset: u64,
}

/// One live span inside a heap
#[derive(Debug, Copy, Clone)]
pub struct HeapRecord {
    pub offset: u64,
    pub alignment: u64,
    pub size: u64,
    pub rebind: RebindRequest,
}

impl HeapRecord {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// The bookkeeping half of a heap
///
/// This tracks the record list only, it knows nothing about Vulkan.
/// Records are kept sorted by offset.
pub struct HeapLayout {
    hl_capacity: u64,
    hl_records: Vec<HeapRecord>,
}

impl HeapLayout {
    pub fn new(capacity: u64) -> Self {
        Self {
            hl_capacity: capacity,
            hl_records: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.hl_capacity
    }

    pub fn records(&self) -> &[HeapRecord] {
        self.hl_records.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.hl_records.is_empty()
    }

    fn record_index(&self, offset: u64) -> Option<usize> {
        self.hl_records.iter().position(|r| r.offset == offset)
    }

    /// Check the structural invariants of the record list
    ///
    /// Records must be disjoint, ordered, and inside the heap. A
    /// violation here means the allocator itself corrupted state, so
    /// it is checked in release builds too and logged.
    fn check_invariants(&self) -> bool {
        for pair in self.hl_records.windows(2) {
            if pair[0].end() > pair[1].offset {
                log::error!(
                    "heap records overlap: [{}, {}) and [{}, {})",
                    pair[0].offset,
                    pair[0].end(),
                    pair[1].offset,
                    pair[1].end()
                );
                debug_assert!(false);
                return false;
            }
        }
        if let Some(last) = self.hl_records.last() {
            if last.end() > self.hl_capacity {
                log::error!(
                    "heap record [{}, {}) extends past capacity {}",
                    last.offset,
                    last.end(),
                    self.hl_capacity
                );
                debug_assert!(false);
                return false;
            }
        }
        return true;
    }

    /// Find space for a new record
    ///
    /// End-point first: bump allocate after the last record. Only if
    /// that does not fit do we walk the gap list front to back. Gaps
    /// bordered by a record with a pending rebind are skipped, which
    /// keeps the live/free boundary stable while defragmentation is
    /// in flight.
    pub fn allocate(&mut self, alignment: u64, size: u64) -> Option<u64> {
        debug_assert!(size > 0);

        // Bump path
        let bump_base = match self.hl_records.last() {
            Some(last) => last.end(),
            None => 0,
        };
        let bump_offset = align_up(bump_base, alignment);
        if bump_offset + size <= self.hl_capacity {
            self.hl_records.push(HeapRecord {
                offset: bump_offset,
                alignment: alignment,
                size: size,
                rebind: RebindRequest::default(),
            });
            self.check_invariants();
            return Some(bump_offset);
        }

        // Gap scan. The leading gap before the first record counts,
        // with a synthetic previous end of zero.
        for i in 0..self.hl_records.len() {
            let gap_base = match i {
                0 => 0,
                _ => self.hl_records[i - 1].end(),
            };
            let gap_end = self.hl_records[i].offset;

            // A pending rebind on either neighbor freezes this gap
            if self.hl_records[i].rebind.requested {
                continue;
            }
            if i > 0 && self.hl_records[i - 1].rebind.requested {
                continue;
            }

            let offset = align_up(gap_base, alignment);
            if offset + size <= gap_end {
                self.hl_records.insert(
                    i,
                    HeapRecord {
                        offset: offset,
                        alignment: alignment,
                        size: size,
                        rebind: RebindRequest::default(),
                    },
                );
                self.check_invariants();
                return Some(offset);
            }
        }

        None
    }

    /// Remove the record at `offset`
    ///
    /// No coalescing happens here, empty spans stay empty until a
    /// defragmentation pass deals with them.
    pub fn free(&mut self, offset: u64) {
        let index = self
            .record_index(offset)
            .expect("Freeing a heap offset that was never allocated");
        self.hl_records.remove(index);
    }

    /// Find the single largest empty span between stable records and
    /// mark the record following it for rebind.
    ///
    /// Returns the byte size of the span that was marked, or None if
    /// the heap has no empty span worth moving for.
    pub fn defragment(&mut self) -> Option<u64> {
        let mut best: Option<(usize, u64, u64)> = None; // (index, target, span)

        for i in 0..self.hl_records.len() {
            let gap_base = match i {
                0 => 0,
                _ => self.hl_records[i - 1].end(),
            };

            // Both the mover and the record it slides up against have
            // to be stable
            if self.hl_records[i].rebind.requested {
                continue;
            }
            if i > 0 && self.hl_records[i - 1].rebind.requested {
                continue;
            }

            let target = align_up(gap_base, self.hl_records[i].alignment);
            if target >= self.hl_records[i].offset {
                continue;
            }
            let span = self.hl_records[i].offset - target;

            match best {
                Some((_, _, best_span)) if best_span >= span => {}
                _ => best = Some((i, target, span)),
            }
        }

        let (index, target, span) = best?;
        self.hl_records[index].rebind = RebindRequest {
            requested: true,
            target_offset: target,
        };
        Some(span)
    }

    /// Move a record to its requested offset and clear the request
    ///
    /// Only the owner of the bound resource calls this, after it has
    /// recreated the underlying API object at the new offset.
    pub fn commit_rebind(&mut self, offset: u64) -> u64 {
        let index = self
            .record_index(offset)
            .expect("Committing a rebind for an unknown record");
        let record = &mut self.hl_records[index];
        assert!(record.rebind.requested);

        let target = record.rebind.target_offset;
        record.offset = target;
        record.rebind = RebindRequest::default();

        self.check_invariants();
        target
    }

    /// Does the record at `offset` have a pending rebind request
    pub fn rebind_target(&self, offset: u64) -> Option<u64> {
        let index = self.record_index(offset)?;
        let record = &self.hl_records[index];
        match record.rebind.requested {
            true => Some(record.rebind.target_offset),
            false => None,
        }
    }
}

/// The Vulkan half of a heap
pub(crate) struct HeapMemory {
    pub(crate) hm_memory: vk::DeviceMemory,
    /// Persistently mapped base pointer, null for device local heaps
    pub(crate) hm_mapped: *mut u8,
    pub(crate) hm_coherent: bool,
}

unsafe impl Send for HeapMemory {}

struct Heap {
    h_layout: HeapLayout,
    h_memory: HeapMemory,
    /// Dedicated heaps hold exactly one oversized binding
    h_dedicated: bool,
}

/// A binding into one of the pool's heaps
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapBinding {
    pub class: MemClass,
    pub heap_index: usize,
    pub offset: u64,
    pub size: u64,
}

/// Suballocates GPU-visible and host-visible memory from chunked heaps
pub struct HeapPool {
    hp_dev: Arc<Device>,
    hp_chunk_size: u64,
    /// heap lists per memory class, guarded by the heap mutex. Lock
    /// order is streamer -> queue -> heap, this one is always last.
    hp_heaps: Mutex<HeapLists>,
}

struct HeapLists {
    hl_device: Vec<Heap>,
    hl_host: Vec<Heap>,
}

impl HeapLists {
    fn class(&mut self, class: MemClass) -> &mut Vec<Heap> {
        match class {
            MemClass::DeviceLocal => &mut self.hl_device,
            MemClass::HostVisible => &mut self.hl_host,
        }
    }
}

impl HeapPool {
    pub fn new(dev: Arc<Device>, info: &CreateInfo) -> Self {
        Self {
            hp_dev: dev,
            hp_chunk_size: info.chunked_working_set_bytes,
            hp_heaps: Mutex::new(HeapLists {
                hl_device: Vec::new(),
                hl_host: Vec::new(),
            }),
        }
    }

    /// The alignment granularity for a memory class
    ///
    /// Host visible spans get flushed and invalidated individually, so
    /// they can never share a non-coherent atom with a neighbor.
    fn granularity(&self, class: MemClass) -> u64 {
        match class {
            MemClass::DeviceLocal => self.hp_dev.pdev_props.limits.buffer_image_granularity,
            MemClass::HostVisible => self.hp_dev.pdev_props.limits.non_coherent_atom_size,
        }
    }

    fn memory_flags(class: MemClass) -> vk::MemoryPropertyFlags {
        match class {
            MemClass::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemClass::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
    }

    fn oom_error(class: MemClass) -> SquallError {
        match class {
            MemClass::DeviceLocal => SquallError::OUT_OF_DEVICE_MEMORY,
            MemClass::HostVisible => SquallError::OUT_OF_HOST_MEMORY,
        }
    }

    /// Create a heap of at least `min_capacity` bytes
    fn create_heap(&self, class: MemClass, min_capacity: u64) -> Result<Heap> {
        let dedicated = min_capacity > self.hp_chunk_size;
        let capacity = partial_max(self.hp_chunk_size, min_capacity);

        let flags = Self::memory_flags(class);
        // Any buffer the engine makes can land in any heap of its
        // class, so pass every type bit and let the flags decide
        let type_index = self
            .hp_dev
            .find_memory_type_index(!0, flags)
            .ok_or(Self::oom_error(class))?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(capacity)
            .memory_type_index(type_index)
            .build();
        let memory = unsafe {
            self.hp_dev
                .dev
                .allocate_memory(&alloc_info, None)
                .or(Err(Self::oom_error(class)))?
        };

        let coherent = self.hp_dev.mem_props.memory_types[type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        let mapped = match class {
            MemClass::HostVisible => unsafe {
                match self.hp_dev.dev.map_memory(
                    memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                ) {
                    Ok(ptr) => ptr as *mut u8,
                    Err(_) => {
                        self.hp_dev.dev.free_memory(memory, None);
                        return Err(SquallError::MAP_FAILED);
                    }
                }
            },
            MemClass::DeviceLocal => std::ptr::null_mut(),
        };

        Ok(Heap {
            h_layout: HeapLayout::new(capacity),
            h_memory: HeapMemory {
                hm_memory: memory,
                hm_mapped: mapped,
                hm_coherent: coherent,
            },
            h_dedicated: dedicated,
        })
    }

    /// Suballocate `size` bytes from a heap of the given class
    ///
    /// Sizes above the chunk size get a dedicated heap. The effective
    /// alignment is the larger of the API requirement and the class
    /// granularity.
    pub fn allocate(&self, class: MemClass, api_alignment: u64, size: u64) -> Result<HeapBinding> {
        let alignment = partial_max(api_alignment, self.granularity(class));
        let mut lists = self.hp_heaps.lock().unwrap();

        if size <= self.hp_chunk_size {
            for (i, heap) in lists.class(class).iter_mut().enumerate() {
                if heap.h_dedicated {
                    continue;
                }
                if let Some(offset) = heap.h_layout.allocate(alignment, size) {
                    return Ok(HeapBinding {
                        class: class,
                        heap_index: i,
                        offset: offset,
                        size: size,
                    });
                }
            }
        }

        // No existing heap could take it, make a new one
        let mut heap = self.create_heap(class, align_up(size, alignment))?;
        let offset = heap
            .h_layout
            .allocate(alignment, size)
            .ok_or(Self::oom_error(class))?;

        let list = lists.class(class);
        list.push(heap);
        Ok(HeapBinding {
            class: class,
            heap_index: list.len() - 1,
            offset: offset,
            size: size,
        })
    }

    /// Release a binding's span back to its heap
    pub fn free(&self, binding: &HeapBinding) {
        let mut lists = self.hp_heaps.lock().unwrap();
        lists.class(binding.class)[binding.heap_index]
            .h_layout
            .free(binding.offset);
    }

    /// Request defragmentation across all heaps of a class
    ///
    /// Owners notice the pending rebind on their binding the next time
    /// the binding goes idle and commit it then.
    pub fn defragment(&self, class: MemClass) {
        let mut lists = self.hp_heaps.lock().unwrap();
        for heap in lists.class(class).iter_mut() {
            if let Some(span) = heap.h_layout.defragment() {
                log::debug!(
                    "Defragmentation requested for empty [{}] span of {} bytes",
                    match class {
                        MemClass::HostVisible => "HOST",
                        MemClass::DeviceLocal => "DEVICE",
                    },
                    span
                );
            }
        }
    }

    /// Does this binding have a pending rebind request
    pub fn rebind_target(&self, binding: &HeapBinding) -> Option<u64> {
        let mut lists = self.hp_heaps.lock().unwrap();
        lists.class(binding.class)[binding.heap_index]
            .h_layout
            .rebind_target(binding.offset)
    }

    /// Commit a pending rebind, the owner has recreated its object
    ///
    /// Returns the updated binding. The requirements the driver
    /// reported for the recreated object must match what was recorded
    /// at allocation time; a driver that disagrees with itself gets
    /// the session killed, since every GPU-visible table offset
    /// derived from this binding would now be suspect.
    pub fn commit_rebind(
        &self,
        binding: &HeapBinding,
        new_reqs: &vk::MemoryRequirements,
    ) -> Result<HeapBinding> {
        if new_reqs.size != binding.size {
            log::error!(
                "driver reported size {} for rebind of span previously sized {}",
                new_reqs.size,
                binding.size
            );
            self.hp_dev.mark_dead();
            return Err(SquallError::INCONSISTENT_API);
        }

        let mut lists = self.hp_heaps.lock().unwrap();
        let new_offset = lists.class(binding.class)[binding.heap_index]
            .h_layout
            .commit_rebind(binding.offset);

        log::debug!(
            "Defragmentation completed, span moved {} -> {}",
            binding.offset,
            new_offset
        );

        Ok(HeapBinding {
            class: binding.class,
            heap_index: binding.heap_index,
            offset: new_offset,
            size: binding.size,
        })
    }

    /// Bind a buffer to its suballocated span
    pub fn bind_buffer(&self, buffer: vk::Buffer, binding: &HeapBinding) -> Result<()> {
        let lists = self.hp_heaps.lock().unwrap();
        let heap = match binding.class {
            MemClass::DeviceLocal => &lists.hl_device[binding.heap_index],
            MemClass::HostVisible => &lists.hl_host[binding.heap_index],
        };

        unsafe {
            self.hp_dev
                .dev
                .bind_buffer_memory(buffer, heap.h_memory.hm_memory, binding.offset)
                .or(Err(SquallError::INVALID))?;
        }
        Ok(())
    }

    /// Get the persistently mapped pointer for a host visible binding
    ///
    /// Returns null if the binding's heap failed to map.
    pub fn mapped_ptr(&self, binding: &HeapBinding) -> *mut u8 {
        assert!(binding.class == MemClass::HostVisible);
        let lists = self.hp_heaps.lock().unwrap();
        let heap = &lists.hl_host[binding.heap_index];
        if heap.h_memory.hm_mapped.is_null() {
            return std::ptr::null_mut();
        }
        unsafe { heap.h_memory.hm_mapped.add(binding.offset as usize) }
    }

    /// Is the binding's backing memory host coherent
    pub fn is_coherent(&self, binding: &HeapBinding) -> bool {
        let lists = self.hp_heaps.lock().unwrap();
        match binding.class {
            MemClass::DeviceLocal => lists.hl_device[binding.heap_index].h_memory.hm_coherent,
            MemClass::HostVisible => lists.hl_host[binding.heap_index].h_memory.hm_coherent,
        }
    }

    /// Invalidate the mapped range covering a non-coherent binding so
    /// host reads see the device's writes
    pub fn invalidate_range(&self, binding: &HeapBinding) -> Result<()> {
        let lists = self.hp_heaps.lock().unwrap();
        let heap = &lists.hl_host[binding.heap_index];
        if heap.h_memory.hm_coherent {
            return Ok(());
        }

        let atom = self.hp_dev.pdev_props.limits.non_coherent_atom_size;
        let range = vk::MappedMemoryRange::builder()
            .memory(heap.h_memory.hm_memory)
            .offset(binding.offset)
            .size(align_up(binding.size, atom))
            .build();
        unsafe {
            self.hp_dev
                .dev
                .invalidate_mapped_memory_ranges(&[range])
                .or(Err(SquallError::MAP_FAILED))?;
        }
        Ok(())
    }

    /// Flush host writes on a non-coherent binding out to the device
    pub fn flush_range(&self, binding: &HeapBinding) -> Result<()> {
        let lists = self.hp_heaps.lock().unwrap();
        let heap = &lists.hl_host[binding.heap_index];
        if heap.h_memory.hm_coherent {
            return Ok(());
        }

        let atom = self.hp_dev.pdev_props.limits.non_coherent_atom_size;
        let range = vk::MappedMemoryRange::builder()
            .memory(heap.h_memory.hm_memory)
            .offset(binding.offset)
            .size(align_up(binding.size, atom))
            .build();
        unsafe {
            self.hp_dev
                .dev
                .flush_mapped_memory_ranges(&[range])
                .or(Err(SquallError::MAP_FAILED))?;
        }
        Ok(())
    }

    pub fn device(&self) -> Arc<Device> {
        self.hp_dev.clone()
    }
}

impl Drop for HeapPool {
    fn drop(&mut self) {
        let mut lists = self.hp_heaps.lock().unwrap();
        unsafe {
            let mut drained: Vec<_> = lists.hl_device.drain(..).collect();
            drained.extend(lists.hl_host.drain(..));
            for heap in drained {
                if !heap.h_memory.hm_mapped.is_null() {
                    self.hp_dev.dev.unmap_memory(heap.h_memory.hm_memory);
                }
                self.hp_dev.dev.free_memory(heap.h_memory.hm_memory, None);
            }
        }
    }
}
