use super::*;
use crate::Debug::StructDebug;
use crate::MPMC::Buffer::layout::ChannelEntry;
use crate::MPMC::Buffer::SlotHeader;
use std::fmt;

// Types holding raw pointers or shared atomics route through StructDebug
impl fmt::Debug for SharedMemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StructDebug::debug_shared_memory_allocator(self, f)
    }
}

impl fmt::Debug for ChannelPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StructDebug::debug_channel_partition(self, f)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StructDebug::debug_ring_buffer(self, f)
    }
}

impl fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StructDebug::debug_channel_entry(self, f)
    }
}

impl fmt::Debug for SlotHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHeader")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .field("meta", &self.meta)
            .finish()
    }
}
