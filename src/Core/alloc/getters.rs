use super::*;

/// Getter methods for SharedMemoryAllocator
///
/// These methods provide access to the private fields of SharedMemoryAllocator
/// for debugging and monitoring purposes.
impl SharedMemoryAllocator {
    /// Get the raw pointer to the GlobalHeader
    pub fn header_ptr(&self) -> *const GlobalHeader {
        self.header
    }

    /// Name of the backing region
    pub fn region_name(&self) -> &str {
        self.shm.name()
    }

    /// Total mapped bytes
    pub fn region_size(&self) -> usize {
        self.shm.size()
    }

    /// Senders currently registered through the control block.
    pub fn sender_count(&self) -> u32 {
        unsafe { (*self.header).senders.load(Ordering::Relaxed) }
    }

    /// Workers currently registered through the control block.
    pub fn worker_count(&self) -> u32 {
        unsafe { (*self.header).workers.load(Ordering::Relaxed) }
    }

    /// Check if the allocator has been properly initialized
    ///
    /// Returns true if the magic number in the header matches the expected value.
    pub fn is_initialized(&self) -> bool {
        unsafe {
            !self.header.is_null()
                && std::ptr::addr_of!((*self.header).magic).read_volatile() == super::MAGIC_NUMBER
        }
    }
}
