// The descriptor data chunk ring
//
// Each command buffer streams a small table of u32 entries to the GPU
// alongside its bindings: PRMT offsets, lengths, dynamic state. The
// table is append-only within a segment, and a segment must stay
// contiguous because the shader indexes it relative to one base. When
// a write lands past the current chunk's reserved range the segment
// rolls: a new chunk is allocated, the live segment is copied over,
// and the old chunk parks on a free list until the owning diagnostic
// allocation retires.
//
// Austin Shafer - 2025

use ash::vk;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::heap::{HeapBinding, HeapPool, MemClass};
use crate::{Result, SquallError};
use sq_utils::log;

use std::sync::Arc;

/// u32 entries per chunk
pub const CHUNK_ENTRY_COUNT: u32 = 1024;
const CHUNK_BYTES: u64 = (CHUNK_ENTRY_COUNT as u64) * 4;

/// One fixed-size host visible chunk
pub struct DataChunk {
    ch_binding: HeapBinding,
    ch_buffer: vk::Buffer,
}

impl DataChunk {
    pub fn buffer(&self) -> vk::Buffer {
        self.ch_buffer
    }
}

/// Where a dispatch's segment starts
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentPoint {
    /// First entry of the segment within the current chunk
    pub base_entry: u32,
}

/// Append-only ring of fixed-size chunks
pub struct DescriptorDataAllocator {
    da_dev: Arc<Device>,
    da_heaps: Arc<HeapPool>,
    da_current: DataChunk,
    /// Start of the open segment in the current chunk
    da_segment_base: u32,
    /// One past the highest entry written in the open segment
    da_segment_head: u32,
    /// Chunks ready for reuse
    da_free: Vec<DataChunk>,
    /// Chunks still referenced by recorded commands. These are tied
    /// to the owning diagnostic allocation's lifetime and only return
    /// to the free list when the command buffer retires.
    da_retired: Vec<DataChunk>,
    /// Set when the segment moved to a fresh chunk since the last
    /// take_rolled()
    da_rolled: bool,
}

impl DescriptorDataAllocator {
    pub fn new(dev: Arc<Device>, heaps: Arc<HeapPool>) -> Result<Self> {
        let first = Self::create_chunk(&dev, &heaps)?;
        Ok(Self {
            da_dev: dev,
            da_heaps: heaps,
            da_current: first,
            da_segment_base: 0,
            da_segment_head: 0,
            da_free: Vec::new(),
            da_retired: Vec::new(),
            da_rolled: false,
        })
    }

    fn create_chunk(dev: &Device, heaps: &HeapPool) -> Result<DataChunk> {
        let (buffer, reqs) =
            dev.create_unbound_buffer(CHUNK_BYTES, vk::BufferUsageFlags::STORAGE_BUFFER)?;
        let binding = match heaps.allocate(MemClass::HostVisible, reqs.alignment, reqs.size) {
            Ok(b) => b,
            Err(e) => {
                unsafe { dev.dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        heaps.bind_buffer(buffer, &binding)?;

        if heaps.mapped_ptr(&binding).is_null() {
            // A descriptor chunk we cannot write is useless, unlike a
            // dead mirror there is no degraded mode here
            unsafe { dev.dev.destroy_buffer(buffer, None) };
            heaps.free(&binding);
            return Err(SquallError::MAP_FAILED);
        }

        Ok(DataChunk {
            ch_binding: binding,
            ch_buffer: buffer,
        })
    }

    /// Open a new segment for the next dispatch
    ///
    /// The segment starts where the previous one ended so unchanged
    /// entries can be reused by writing nothing.
    pub fn begin_segment(&mut self) -> SegmentPoint {
        self.da_segment_base = self.da_segment_head;
        SegmentPoint {
            base_entry: self.da_segment_base,
        }
    }

    /// Write one entry of the open segment
    ///
    /// `index` is relative to the segment base. Returns true if the
    /// write forced the segment onto a fresh chunk; the caller then
    /// has to rebind its descriptor and push the new base.
    pub fn set(&mut self, index: u32, value: u32) -> Result<bool> {
        let mut rolled = false;
        if self.da_segment_base + index >= CHUNK_ENTRY_COUNT {
            self.roll()?;
            rolled = true;
        }

        let entry = self.da_segment_base + index;
        let base = self.da_heaps.mapped_ptr(&self.da_current.ch_binding);
        unsafe {
            (base as *mut u32).add(entry as usize).write(value);
        }
        self.da_segment_head = std::cmp::max(self.da_segment_head, entry + 1);

        Ok(rolled)
    }

    /// Move the open segment to a fresh chunk
    ///
    /// The entries written so far move with it, the shader needs the
    /// whole segment contiguous.
    fn roll(&mut self) -> Result<()> {
        let next = match self.da_free.pop() {
            Some(chunk) => chunk,
            None => match Self::create_chunk(&self.da_dev, &self.da_heaps) {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Running dry on host memory mid-dispatch cannot
                    // be recovered from, the dispatch has to abort
                    log::error!("descriptor data chunk roll failed: {:?}", e);
                    return Err(e);
                }
            },
        };

        let live_entries = self.da_segment_head - self.da_segment_base;
        unsafe {
            let src = (self.da_heaps.mapped_ptr(&self.da_current.ch_binding) as *const u32)
                .add(self.da_segment_base as usize);
            let dst = self.da_heaps.mapped_ptr(&next.ch_binding) as *mut u32;
            std::ptr::copy_nonoverlapping(src, dst, live_entries as usize);
        }

        let old = std::mem::replace(&mut self.da_current, next);
        self.da_retired.push(old);
        self.da_segment_base = 0;
        self.da_segment_head = live_entries;
        self.da_rolled = true;
        Ok(())
    }

    /// Did the segment roll since the last check
    pub fn take_rolled(&mut self) -> bool {
        std::mem::replace(&mut self.da_rolled, false)
    }

    pub fn current_buffer(&self) -> vk::Buffer {
        self.da_current.ch_buffer
    }

    pub fn current_segment(&self) -> SegmentPoint {
        SegmentPoint {
            base_entry: self.da_segment_base,
        }
    }

    /// Flush host writes so the device sees the table
    pub fn commit(&self) -> Result<()> {
        self.da_heaps.flush_range(&self.da_current.ch_binding)
    }

    /// The owning command buffer retired, recycle everything
    pub fn reset(&mut self) {
        let retired: Vec<_> = self.da_retired.drain(..).collect();
        for chunk in retired {
            self.da_free.push(chunk);
        }
        self.da_segment_base = 0;
        self.da_segment_head = 0;
        self.da_rolled = false;
    }

    pub fn destroy(&mut self) {
        let chunks: Vec<_> = self
            .da_retired
            .drain(..)
            .chain(self.da_free.drain(..))
            .collect();
        for chunk in chunks {
            unsafe { self.da_dev.dev.destroy_buffer(chunk.ch_buffer, None) };
            self.da_heaps.free(&chunk.ch_binding);
        }
        unsafe { self.da_dev.dev.destroy_buffer(self.da_current.ch_buffer, None) };
        self.da_heaps.free(&self.da_current.ch_binding);
    }
}
