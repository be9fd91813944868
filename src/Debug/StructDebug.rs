use crate::Core::alloc::ChannelPartition;
use crate::Core::alloc::SharedMemoryAllocator;
use crate::MPMC::Buffer::RingBuffer;
use crate::MPMC::Buffer::layout::ChannelEntry;
use std::fmt;
use std::sync::atomic::Ordering;

/// Debug function for SharedMemoryAllocator
///
/// Provides a safe debug representation that shows:
/// - Region name and size
/// - Header pointer location
/// - Channel count and control-plane registrations
/// - Initialization and shutdown status
pub fn debug_shared_memory_allocator(allocator: &SharedMemoryAllocator, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedMemoryAllocator")
        .field("region", &allocator.region_name())
        .field("size", &allocator.region_size())
        .field("header", &format_args!("{:p}", allocator.header_ptr()))
        .field("channels", &allocator.channel_count())
        .field("senders", &allocator.sender_count())
        .field("workers", &allocator.worker_count())
        .field("initialized", &allocator.is_initialized())
        .field("closed", &allocator.is_closed())
        .finish()
}

/// Debug function for ChannelPartition
pub fn debug_channel_partition(partition: &ChannelPartition, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelPartition")
        .field("channel_id", &partition.channel_id)
        .field("capacity", &partition.capacity)
        .field("buffer", &partition.buffer)
        .finish()
}

/// Debug function for RingBuffer
///
/// Shows the band location and geometry; the cursors are read, never the slots
pub fn debug_ring_buffer(buffer: &RingBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingBuffer")
        .field("band", &format_args!("0x{:x}", buffer.buffer_base as usize))
        .field("slots", &buffer.capacity)
        .field("slot_payload", &buffer.slot_payload)
        .field("stride", &buffer.stride)
        .field("pending", &buffer.len())
        .finish()
}

/// Debug function for ChannelEntry
pub fn debug_channel_entry(entry: &ChannelEntry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelEntry")
        .field("channel_id", &entry.channel_id)
        .field("capacity", &entry.capacity)
        .field("slot_payload", &entry.slot_payload)
        .field("band_offset", &entry.band_offset)
        .field("head", &entry.head.load(Ordering::Relaxed))
        .field("tail", &entry.tail.load(Ordering::Relaxed))
        .finish()
}
