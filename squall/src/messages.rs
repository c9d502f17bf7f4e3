// GPU message stream layout
//
// Instrumented shaders export diagnostics as 64-bit packed records
// appended to a per-command-buffer stream buffer. Both the device
// buffer and its host mirror start with a StreamHeader followed by
// `capacity` message slots. The counter is bumped with a shader-side
// atomic, so written_count can run past capacity; slots past the
// limit are never stored.
//
// Austin Shafer - 2025

use std::mem;

/// Value of the header cookie on a freshly initialized stream
pub const DEBUG_COOKIE_DEFAULT: u32 = 42;
/// Cookie after the stream's backing span was moved by defragmentation
pub const DEBUG_COOKIE_MOVED: u32 = 56;

/// The header at offset zero of every stream buffer
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Total messages the shaders tried to export. Monotonic during a
    /// submission, may exceed capacity.
    pub written_count: u32,
    /// Number of message slots in this stream
    pub capacity: u32,
    /// Corruption canary, either DEFAULT or MOVED
    pub debug_cookie: u32,
    /// How many messages the last readback actually copied to the
    /// mirror. Always <= min(written_count, capacity).
    pub transferred_count: u32,
}

pub const STREAM_HEADER_SIZE: u64 = mem::size_of::<StreamHeader>() as u64;
pub const MESSAGE_SIZE: u64 = mem::size_of::<u64>() as u64;

/// Byte size of a whole stream buffer with `capacity` slots
pub fn stream_buffer_size(capacity: u32) -> u64 {
    STREAM_HEADER_SIZE + MESSAGE_SIZE * capacity as u64
}

/// Message type ids, the high byte of every packed record
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageUid {
    UninitializedResource = 1,
    OutOfBounds = 2,
    DescriptorMismatch = 3,
}

impl MessageUid {
    pub fn from_raw(raw: u8) -> Option<MessageUid> {
        match raw {
            1 => Some(MessageUid::UninitializedResource),
            2 => Some(MessageUid::OutOfBounds),
            3 => Some(MessageUid::DescriptorMismatch),
            _ => None,
        }
    }
}

/// One 64-bit packed record: [63:56] message uid, [55:0] payload
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpuMessage(pub u64);

pub const PAYLOAD_BITS: u32 = 56;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

impl GpuMessage {
    pub fn pack(uid: MessageUid, payload: u64) -> GpuMessage {
        debug_assert!(payload <= PAYLOAD_MASK);
        GpuMessage(((uid as u64) << PAYLOAD_BITS) | (payload & PAYLOAD_MASK))
    }

    pub fn uid(&self) -> Option<MessageUid> {
        MessageUid::from_raw((self.0 >> PAYLOAD_BITS) as u8)
    }

    pub fn payload(&self) -> u64 {
        self.0 & PAYLOAD_MASK
    }
}

/// Failure codes carried by resource metadata and exported in
/// initialization messages. A shader that trips on a resource we
/// could not track reports the code instead of a false positive.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureCode {
    Ok = 0,
    Untracked = 1,
    MetadataRequiresClear = 2,
}

impl FailureCode {
    pub fn from_raw(raw: u64) -> FailureCode {
        match raw {
            1 => FailureCode::Untracked,
            2 => FailureCode::MetadataRequiresClear,
            _ => FailureCode::Ok,
        }
    }
}

// UninitializedResource payload layout:
//   [55:30] puid           (26 bits)
//   [29:28] failure code   (2 bits)
//   [27:0]  element offset (28 bits, saturating)
//
// The element offset is a byte offset for buffers and a linear texel
// index for images. Accesses past the 28-bit range saturate, the
// handler flags the report as truncated.
pub const INIT_DETAIL_BITS: u32 = 28;
pub const INIT_DETAIL_MAX: u64 = (1 << INIT_DETAIL_BITS) - 1;

pub fn pack_uninitialized(puid: u32, code: FailureCode, offset: u64) -> GpuMessage {
    debug_assert!((puid as usize) <= niebla::PUID_CEILING);
    let detail = std::cmp::min(offset, INIT_DETAIL_MAX);
    let payload =
        ((puid as u64) << 30) | ((code as u64) << INIT_DETAIL_BITS) | detail;
    GpuMessage::pack(MessageUid::UninitializedResource, payload)
}

pub fn unpack_uninitialized(msg: GpuMessage) -> (u32, FailureCode, u64) {
    let payload = msg.payload();
    let puid = (payload >> 30) as u32;
    let code = FailureCode::from_raw((payload >> INIT_DETAIL_BITS) & 0x3);
    let offset = payload & INIT_DETAIL_MAX;
    (puid, code, offset)
}

/// Access kinds reported by the bounds checker
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
}

// OutOfBounds payload layout:
//   [55:36] sguid          (20 bits, shader source location)
//   [35]    access kind    (1 bit)
//   [34:0]  element offset (35 bits)
//
// An out of bounds report always implies count == 0 on the metadata
// side, the instrumented access never modifies tracking bits.
pub fn pack_out_of_bounds(sguid: u32, kind: AccessKind, offset: u64) -> GpuMessage {
    debug_assert!(sguid < (1 << 20));
    let detail = std::cmp::min(offset, (1u64 << 35) - 1);
    let payload = ((sguid as u64) << 36) | ((kind as u64) << 35) | detail;
    GpuMessage::pack(MessageUid::OutOfBounds, payload)
}

pub fn unpack_out_of_bounds(msg: GpuMessage) -> (u32, AccessKind, u64) {
    let payload = msg.payload();
    let sguid = (payload >> 36) as u32;
    let kind = match (payload >> 35) & 1 {
        0 => AccessKind::Read,
        _ => AccessKind::Write,
    };
    (sguid, kind, payload & ((1u64 << 35) - 1))
}

// DescriptorMismatch payload layout:
//   [55:36] sguid          (20 bits)
//   [35:28] set slot       (8 bits)
//   [27:16] binding        (12 bits)
//   [15:8]  expected type  (8 bits)
//   [7:0]   observed type  (8 bits)
pub fn pack_descriptor_mismatch(
    sguid: u32,
    slot: u8,
    binding: u16,
    expected: u8,
    observed: u8,
) -> GpuMessage {
    debug_assert!(sguid < (1 << 20));
    debug_assert!(binding < (1 << 12));
    let payload = ((sguid as u64) << 36)
        | ((slot as u64) << 28)
        | ((binding as u64) << 16)
        | ((expected as u64) << 8)
        | observed as u64;
    GpuMessage::pack(MessageUid::DescriptorMismatch, payload)
}

pub fn unpack_descriptor_mismatch(msg: GpuMessage) -> (u32, u8, u16, u8, u8) {
    let payload = msg.payload();
    (
        (payload >> 36) as u32,
        ((payload >> 28) & 0xff) as u8,
        ((payload >> 16) & 0xfff) as u16,
        ((payload >> 8) & 0xff) as u8,
        (payload & 0xff) as u8,
    )
}
