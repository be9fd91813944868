use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::MPMC::Buffer::layout::{GlobalHeader, MAX_CHANNELS};
use crate::MPMC::Buffer::{slot_stride, RingBuffer};
use crossbeam_utils::CachePadded;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
mod debug;
mod getters;

// Use parking_lot's Mutex for better performance
use parking_lot::Mutex;
use tracing::warn;

pub(crate) const MAGIC_NUMBER: u64 = 0x5245_4C41_595F_4D45; // "RELAY_ME"
const LAYOUT_VERSION: u32 = 3;

/// Represents a single channel's memory region
pub struct ChannelPartition {
    /// The underlying ring buffer for this channel
    pub buffer: RingBuffer,
    /// The unique identifier for this channel
    pub channel_id: u32,
    /// The capacity of the channel
    pub capacity: usize,
}

/// Allocator for the channels of one named shared memory region
pub struct SharedMemoryAllocator {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut GlobalHeader,
    owner: bool,
    allocation_mutex: Mutex<()>, // For thread-safe channel creation
}

/// Bytes a region needs to hold `channels` channels of `capacity` slots of `slot_payload` bytes.
pub fn region_size(channels: usize, capacity: usize, slot_payload: usize) -> usize {
    let control = align128(std::mem::size_of::<GlobalHeader>());
    control + channels * align128(capacity * slot_stride(slot_payload))
}

#[inline]
fn align128(n: usize) -> usize {
    (n + 127) & !127
}

impl SharedMemoryAllocator {
    /// Create a new named region of (at least) `size` bytes and initialize its header.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let aligned_size = align128(size);
        let control_size = std::mem::size_of::<GlobalHeader>();

        // Ensure there's enough space after the header
        if aligned_size < control_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("SharedMemoryAllocator::create(): size too small to fit header. Requested: {}, Needed: {}", aligned_size, control_size),
            ));
        }

        let shm = match crate::Core::SharedMemory::create_shared_memory(aligned_size, name) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && Self::is_stale(name) => {
                warn!(region = name, "reclaiming stale shared memory region");
                crate::Core::SharedMemory::unlink_shared_memory(name)?;
                crate::Core::SharedMemory::create_shared_memory(aligned_size, name)
            }
            other => other,
        }
        .map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to create shared memory {name}:\n\
                    ├─ Aligned size: {aligned_size}\n\
                    ├─ Header size:  {control_size}\n\
                    ╰─ Error: {e}"
                ),
            )
        })?;

        let header_ptr = shm.as_ptr() as *mut GlobalHeader;
        if (header_ptr as usize) % 128 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        // Initialize global header; the fresh file is zero-filled so channel entries start unused
        unsafe {
            std::ptr::addr_of_mut!((*header_ptr).version).write(LAYOUT_VERSION);
            std::ptr::addr_of_mut!((*header_ptr).max_channels).write(MAX_CHANNELS as u32);
            (*header_ptr).channel_count.store(0, Ordering::Relaxed);
            (*header_ptr).closed.store(0, Ordering::Relaxed);
            (*header_ptr).senders.store(0, Ordering::Relaxed);
            (*header_ptr).workers.store(0, Ordering::Relaxed);
            (*header_ptr).owner_pid.store(std::process::id(), Ordering::Relaxed);
            // Magic goes last so attachers never see a half-built header
            std::sync::atomic::fence(Ordering::Release);
            std::ptr::addr_of_mut!((*header_ptr).magic).write_volatile(MAGIC_NUMBER);
        }

        Ok(Self {
            shm,
            header: header_ptr,
            owner: true,
            allocation_mutex: Mutex::new(()),
        })
    }

    /// A region left behind by a creator that closed it or no longer runs.
    /// Anything unreadable or foreign is not ours to remove.
    fn is_stale(name: &str) -> bool {
        match Self::attach(name) {
            Ok(peer) => peer.is_closed() || !peer.owner_alive(),
            Err(_) => false,
        }
    }

    /// Attach to an existing named region
    pub fn attach(name: &str) -> io::Result<Self> {
        let min_required_size = std::mem::size_of::<GlobalHeader>();
        let shm = crate::Core::SharedMemory::attach_shared_memory(name, min_required_size)?;

        let header = shm.as_ptr() as *mut GlobalHeader;
        if (header as usize) % 128 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        // Verify magic number and version
        unsafe {
            if std::ptr::addr_of!((*header).magic).read_volatile() != MAGIC_NUMBER {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Invalid magic number - shared memory not properly initialized",
                ));
            }
            std::sync::atomic::fence(Ordering::Acquire);
            if (*header).version != LAYOUT_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unsupported region layout version {}", (*header).version),
                ));
            }
        }

        Ok(Self {
            shm,
            header,
            owner: false,
            allocation_mutex: Mutex::new(()),
        })
    }

    /// Create a new channel with `capacity` slots of `slot_payload` bytes each.
    pub fn create_channel(&self, capacity: usize, slot_payload: usize) -> io::Result<ChannelPartition> {
        // Validate capacity is a power of two and non-zero
        if capacity == 0 || (capacity & (capacity - 1)) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Capacity must be a power of two and greater than zero",
            ));
        }
        if slot_payload == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Slot payload must be greater than zero",
            ));
        }

        let channel_size = align128(capacity * slot_stride(slot_payload));

        // Use a mutex to prevent multiple threads from allocating overlapping memory
        let _guard = self.allocation_mutex.lock();

        let (channel_id, offset) = {
            let header = unsafe { &*self.header };
            let channel_id = header.channel_count.load(Ordering::Acquire);
            if channel_id as usize >= MAX_CHANNELS {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Maximum number of channels reached",
                ));
            }

            // Channels are laid out back to back after the header
            let mut offset = align128(std::mem::size_of::<GlobalHeader>());
            for ch in &header.channels[..channel_id as usize] {
                let ch_end = ch.band_offset as usize
                    + align128(ch.capacity as usize * slot_stride(ch.slot_payload as usize));
                offset = offset.max(ch_end);
            }
            (channel_id, offset)
        };

        if offset + channel_size > self.shm.size() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "Not enough space in shared memory: need {} bytes at offset {}, region is {}",
                    channel_size,
                    offset,
                    self.shm.size()
                ),
            ));
        }

        // Initialize channel metadata
        let channel = unsafe { &mut (*self.header).channels[channel_id as usize] };
        channel.channel_id = channel_id;
        channel.flags = 0;
        channel.band_offset = offset as u64;
        channel.slot_payload = slot_payload as u64;
        channel.signal = AtomicU32::new(0);
        channel.tail = CachePadded::new(AtomicU64::new(0));
        channel.head = CachePadded::new(AtomicU64::new(0));
        channel.capacity = capacity as u64;

        let buffer_ptr = unsafe { self.shm.as_ptr().add(offset) };
        let ring_buffer = unsafe { RingBuffer::new(channel, buffer_ptr) };

        // Initialize slots (only done by creator)
        unsafe {
            ring_buffer.init_slots();
        }

        unsafe {
            (*self.header)
                .channel_count
                .store(channel_id + 1, Ordering::Release);
        }

        Ok(ChannelPartition {
            buffer: ring_buffer,
            channel_id,
            capacity,
        })
    }

    /// Get a channel by ID
    pub fn get_channel(&self, channel_id: u32) -> Option<ChannelPartition> {
        let header = unsafe { &*self.header };
        if channel_id >= header.channel_count.load(Ordering::Acquire) {
            return None; // Channel not initialized
        }

        let channel = &header.channels[channel_id as usize];
        let capacity = channel.capacity as usize;
        if capacity == 0 || capacity & (capacity - 1) != 0 {
            return None;
        }
        let band_end = channel.band_offset as usize
            + capacity * slot_stride(channel.slot_payload as usize);
        if band_end > self.shm.size() {
            return None;
        }

        let buffer_ptr = unsafe { self.shm.as_ptr().add(channel.band_offset as usize) };
        let ring_buffer = unsafe { RingBuffer::new(channel, buffer_ptr) };

        Some(ChannelPartition {
            buffer: ring_buffer,
            channel_id,
            capacity,
        })
    }

    // Get the number of active channels
    pub fn channel_count(&self) -> u32 {
        unsafe { (*self.header).channel_count.load(Ordering::Acquire) }
    }

    /// Mark the region as shut down; attached peers observe it through `is_closed`.
    pub fn close(&self) {
        unsafe {
            (*self.header).closed.store(1, Ordering::Release);
        }
        for ch in 0..self.channel_count() {
            if let Some(partition) = self.get_channel(ch) {
                partition.buffer.signal_consumer();
            }
        }
    }

    /// True once the creator shut the region down.
    pub fn is_closed(&self) -> bool {
        unsafe { (*self.header).closed.load(Ordering::Acquire) != 0 }
    }

    /// Register one sender in the region's control block; returns the new count.
    pub fn register_sender(&self) -> u32 {
        unsafe { (*self.header).senders.fetch_add(1, Ordering::AcqRel) + 1 }
    }

    /// Register one receive worker; returns the new count.
    pub fn register_worker(&self) -> u32 {
        unsafe { (*self.header).workers.fetch_add(1, Ordering::AcqRel) + 1 }
    }

    /// Deregister one receive worker. Fails if none is registered.
    pub fn deregister_worker(&self) -> io::Result<u32> {
        let workers = unsafe { &(*self.header).workers };
        workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "no worker registered"))
    }

    /// True while the creating process still exists.
    pub fn owner_alive(&self) -> bool {
        let pid = unsafe { (*self.header).owner_pid.load(Ordering::Acquire) };
        if pid == 0 {
            return false;
        }
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        // EPERM: alive but owned by someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// True for the process that created (and will unlink) the region.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl ChannelPartition {
    /// Get the channel ID
    pub fn id(&self) -> u32 {
        self.channel_id
    }

    /// Get a reference to the underlying ring buffer
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }
}

// Implement Send + Sync since we manage synchronization internally
unsafe impl Send for SharedMemoryAllocator {}
unsafe impl Sync for SharedMemoryAllocator {}

impl Drop for SharedMemoryAllocator {
    fn drop(&mut self) {
        // The creator owns the name; attached peers keep their mapping until they drop it
        if self.owner {
            self.close();
            let _ = crate::Core::SharedMemory::unlink_if_current(&*self.shm);
        }
    }
}
