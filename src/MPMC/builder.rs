use super::{Consumer, Producer};
use crate::Core::alloc::{region_size, ChannelPartition, SharedMemoryAllocator};
use std::io;
use std::time::{Duration, Instant};

/// Builds producers and consumers for a named shared memory event queue.
pub struct ChannelBuilder {
    region: String,
    capacity: usize,
    slot_payload: usize,
    create: bool,
    open_wait: Duration,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self {
            region: "relay_events".to_string(),
            capacity: 64,
            slot_payload: 2 * 1024 * 1024, // 2 MiB per event
            create: false,
            open_wait: Duration::ZERO,
        }
    }
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Number of slots (power of two), used when the queue gets created.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Maximum event length, used when the queue gets created.
    pub fn with_slot_payload(mut self, slot_payload: usize) -> Self {
        self.slot_payload = slot_payload;
        self
    }

    /// Create the queue when no region with this name exists yet.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// How long to wait for somebody else to create the queue.
    pub fn with_open_wait(mut self, wait: Duration) -> Self {
        self.open_wait = wait;
        self
    }

    pub fn build_producer(self) -> io::Result<Producer> {
        let (allocator, channel) = self.open()?;
        Ok(Producer::new(allocator, channel))
    }

    pub fn build_consumer(self) -> io::Result<Consumer> {
        let (allocator, channel) = self.open()?;
        Ok(Consumer::new(allocator, channel))
    }

    fn open(&self) -> io::Result<(SharedMemoryAllocator, ChannelPartition)> {
        let deadline = Instant::now() + self.open_wait;

        let allocator = loop {
            match SharedMemoryAllocator::attach(&self.region) {
                Ok(allocator) => break allocator,
                Err(e) if e.kind() == io::ErrorKind::NotFound && self.create => {
                    match self.create_queue() {
                        // Lost the race to another creator; attach to theirs
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                        other => return other,
                    }
                }
                // NotFound: not created yet; InvalidData: creator still writing the header
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidData)
                        && Instant::now() < deadline =>
                {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e),
            }
        };

        let channel = allocator.get_channel(0).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no event queue in {}", self.region),
            )
        })?;
        Ok((allocator, channel))
    }

    fn create_queue(&self) -> io::Result<(SharedMemoryAllocator, ChannelPartition)> {
        let size = region_size(1, self.capacity, self.slot_payload);
        let allocator = SharedMemoryAllocator::create(&self.region, size)?;
        let channel = allocator.create_channel(self.capacity, self.slot_payload)?;
        Ok((allocator, channel))
    }
}
