// This is the shared ring buffer for MPMC - one per channel band

use super::layout::ChannelEntry;
use crate::MPMC::Structs::Buffer_Structs::FrameMeta;

use std::mem::size_of;
use std::sync::atomic::AtomicU64;

/// Alignment of every slot in a data band.
pub const SLOT_ALIGN: usize = 64;

/// The fixed head of a slot. The payload follows it directly in memory;
/// its size is per-channel (`ChannelEntry::slot_payload`).
///
/// It is marked `#[repr(C)]` to ensure a defined and stable memory layout.
#[repr(C, align(64))]
pub struct SlotHeader {
    /// The sequence number of the slot. This is the core of the synchronization.
    /// - A producer claims a `tail` sequence and waits for the `sequence` in
    ///   the target slot to equal `tail`.
    /// - After writing, it sets the `sequence` to `tail + 1`, signaling completion.
    /// - A consumer waits for the `sequence` in its `head` slot to equal
    ///   `head + 1`.
    pub sequence: AtomicU64,

    /// Frame metadata (event number, fragment position, etc.).
    pub meta: FrameMeta,
}

/// Bytes one slot occupies for a given payload size.
#[inline]
pub fn slot_stride(slot_payload: usize) -> usize {
    let raw = size_of::<SlotHeader>() + slot_payload;
    (raw + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// A lock-free, multi-producer, multi-consumer (MPMC) ring buffer view.
///
/// This struct is NOT stored in shared memory. It is a transient view that holds
/// pointers to the shared memory region.
///
/// ### Concurrency Design:
/// - **Producers (Enqueue)**: Producers claim a slot by atomically incrementing `tail`.
///   They use the `sequence` field in the `SlotHeader` to know when the slot is free to
///   be written.
/// - **Consumers (Dequeue)**: Consumers claim a message by atomically incrementing `head`.
///   They use the `sequence` field to know when a message has been fully written by a producer.
pub struct RingBuffer {
    /// Pointer to the channel metadata in the control area.
    pub(crate) metadata: *const ChannelEntry,

    /// Pointer to the start of this channel's data band.
    pub(crate) buffer_base: *mut u8,

    /// The capacity of the buffer (number of slots).
    pub(crate) capacity: usize,

    /// A bitmask used to wrap sequence numbers around the buffer.
    /// Calculated as `capacity - 1`.
    pub(crate) mask: usize,

    /// Payload bytes per slot.
    pub(crate) slot_payload: usize,

    /// Distance between two consecutive slots.
    pub(crate) stride: usize,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}
