// The texel memory allocator
//
// Per-resource GPU metadata lives in one global device buffer: one
// bit per texel (or per 32-element group for huge resources), packed
// into u32 words. Each tracked resource owns a span of words, and the
// PUID-to-base map tells shaders where a resource's bits start. This
// generalizes past the initialization tracker, any feature that wants
// per-texel state can take a block here.
//
// Austin Shafer - 2025

use ash::vk;

extern crate utils as sq_utils;
use crate::device::Device;
use crate::heap::{HeapBinding, HeapPool, MemClass};
use crate::messages::FailureCode;
use crate::{Result, SquallError};
use sq_utils::log;

use std::sync::{Arc, Mutex};

/// Word capacity of the global metadata buffer, 32 MB of bits
const GLOBAL_WORD_CAPACITY: u32 = (32 * 1024 * 1024) / 4;

/// Resources past this texel count get tracked at group granularity,
/// one bit per 32 texels
pub const GROUP_TRACKING_THRESHOLD: u64 = 1 << 28;

/// Marker in the PUID map for resources with no metadata
pub const UNTRACKED_BLOCK: u32 = u32::MAX;

/// What the allocator needs to know about a resource
#[derive(Debug, Clone, Copy)]
pub struct TexelResourceInfo {
    pub width: u64,
    pub height: u64,
    pub depth: u64,
    /// Tiled resources only track dimensions the hardware lays out
    /// predictably; extents in untracked dimensions clamp to 1
    pub tiled: bool,
    pub tracked_width: bool,
    pub tracked_height: bool,
    pub tracked_depth: bool,
}

impl TexelResourceInfo {
    pub fn buffer(bytes: u64) -> Self {
        Self {
            width: bytes,
            height: 1,
            depth: 1,
            tiled: false,
            tracked_width: true,
            tracked_height: true,
            tracked_depth: true,
        }
    }

    /// Effective texel count after the tiled-dimension cap
    pub fn texel_count(&self) -> u64 {
        let clamp = |extent: u64, tracked: bool| match self.tiled && !tracked {
            true => 1,
            false => extent.max(1),
        };
        clamp(self.width, self.tracked_width)
            * clamp(self.height, self.tracked_height)
            * clamp(self.depth, self.tracked_depth)
    }
}

/// A span of the global buffer owned by one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelMemoryBlock {
    /// First word of the span in the global buffer
    pub base_block_index: u32,
    pub texel_count: u64,
    pub word_count: u32,
    /// Texels per bit, 1 or 32
    pub granularity: u32,
    pub failure_code: FailureCode,
}

impl TexelMemoryBlock {
    /// The word and bit covering a texel of this block
    pub fn bit_address(&self, texel: u64) -> (u32, u32) {
        let bit = texel / self.granularity as u64;
        (
            self.base_block_index + (bit / 32) as u32,
            (bit % 32) as u32,
        )
    }
}

/// Word-granular first-fit span bookkeeping, no Vulkan in sight
pub struct SpanList {
    sl_capacity: u32,
    /// (offset, length) free spans sorted by offset
    sl_free: Vec<(u32, u32)>,
}

impl SpanList {
    pub fn new(capacity: u32) -> Self {
        Self {
            sl_capacity: capacity,
            sl_free: vec![(0, capacity)],
        }
    }

    pub fn allocate(&mut self, words: u32) -> Option<u32> {
        let pos = self.sl_free.iter().position(|(_, len)| *len >= words)?;
        let (offset, len) = self.sl_free[pos];

        if len == words {
            self.sl_free.remove(pos);
        } else {
            self.sl_free[pos] = (offset + words, len - words);
        }
        Some(offset)
    }

    pub fn free(&mut self, offset: u32, words: u32) {
        let pos = self
            .sl_free
            .iter()
            .position(|(off, _)| *off > offset)
            .unwrap_or(self.sl_free.len());
        self.sl_free.insert(pos, (offset, words));

        // Merge with neighbors
        if pos + 1 < self.sl_free.len() {
            let (next_off, next_len) = self.sl_free[pos + 1];
            if offset + words == next_off {
                self.sl_free[pos].1 += next_len;
                self.sl_free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_off, prev_len) = self.sl_free[pos - 1];
            if prev_off + prev_len == offset {
                self.sl_free[pos - 1].1 += self.sl_free[pos].1;
                self.sl_free.remove(pos);
            }
        }
    }

    pub fn free_words(&self) -> u32 {
        self.sl_free.iter().map(|(_, len)| len).sum()
    }

    pub fn capacity(&self) -> u32 {
        self.sl_capacity
    }
}

/// Allocates bitset spans out of the global metadata buffer
pub struct TexelAllocator {
    ta_dev: Arc<Device>,
    ta_heaps: Arc<HeapPool>,
    ta_buffer: vk::Buffer,
    ta_binding: HeapBinding,
    ta_spans: Mutex<SpanList>,
}

impl TexelAllocator {
    pub fn new(dev: Arc<Device>, heaps: Arc<HeapPool>) -> Result<Self> {
        let bytes = GLOBAL_WORD_CAPACITY as u64 * 4;
        let (buffer, reqs) = dev.create_unbound_buffer(
            bytes,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let binding = match heaps.allocate(MemClass::DeviceLocal, reqs.alignment, reqs.size) {
            Ok(b) => b,
            Err(e) => {
                unsafe { dev.dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        heaps.bind_buffer(buffer, &binding)?;

        Ok(Self {
            ta_dev: dev,
            ta_heaps: heaps,
            ta_buffer: buffer,
            ta_binding: binding,
            ta_spans: Mutex::new(SpanList::new(GLOBAL_WORD_CAPACITY)),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.ta_buffer
    }

    pub fn byte_capacity(&self) -> u64 {
        GLOBAL_WORD_CAPACITY as u64 * 4
    }

    /// Reserve a bitset span for a resource
    ///
    /// Huge resources degrade to group tracking rather than eat the
    /// whole buffer. When even that cannot be placed the block comes
    /// back with the UNTRACKED failure code so shaders report instead
    /// of false-positive.
    pub fn allocate(&self, info: &TexelResourceInfo) -> TexelMemoryBlock {
        let texel_count = info.texel_count();
        let granularity: u32 = match texel_count > GROUP_TRACKING_THRESHOLD {
            true => 32,
            false => 1,
        };
        let bits = (texel_count + granularity as u64 - 1) / granularity as u64;
        let words = ((bits + 31) / 32) as u32;

        let offset = self.ta_spans.lock().unwrap().allocate(words);
        match offset {
            Some(base) => TexelMemoryBlock {
                base_block_index: base,
                texel_count: texel_count,
                word_count: words,
                granularity: granularity,
                // Fresh metadata is garbage until a clear runs
                failure_code: FailureCode::MetadataRequiresClear,
            },
            None => {
                log::error!(
                    "no metadata space for resource of {} texels, marking untracked",
                    texel_count
                );
                TexelMemoryBlock {
                    base_block_index: UNTRACKED_BLOCK,
                    texel_count: texel_count,
                    word_count: 0,
                    granularity: granularity,
                    failure_code: FailureCode::Untracked,
                }
            }
        }
    }

    /// Record the zeroing of a block's bits and mark it clean
    ///
    /// `cmd` must be executing on a queue with transfer capability
    /// before any shader reads the block.
    pub fn initialize(
        &self,
        cmd: vk::CommandBuffer,
        block: &mut TexelMemoryBlock,
    ) -> Result<()> {
        if block.base_block_index == UNTRACKED_BLOCK {
            return Err(SquallError::UNTRACKED);
        }

        unsafe {
            self.ta_dev.dev.cmd_fill_buffer(
                cmd,
                self.ta_buffer,
                block.base_block_index as u64 * 4,
                block.word_count as u64 * 4,
                0,
            );
        }
        block.failure_code = FailureCode::Ok;
        Ok(())
    }

    /// Residency transitions for the backing buffer
    ///
    /// The global buffer is plain bound memory on this backend, so
    /// there is nothing to page; sparse-backed platforms hook their
    /// transitions in here.
    pub fn update_residency(&self, _queue: vk::Queue) {}

    /// Release a span back to the free list
    pub fn free(&self, block: &TexelMemoryBlock) {
        if block.base_block_index == UNTRACKED_BLOCK {
            return;
        }
        self.ta_spans
            .lock()
            .unwrap()
            .free(block.base_block_index, block.word_count);
    }
}

impl Drop for TexelAllocator {
    fn drop(&mut self) {
        unsafe { self.ta_dev.dev.destroy_buffer(self.ta_buffer, None) };
        self.ta_heaps.free(&self.ta_binding);
    }
}
