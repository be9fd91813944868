use crate::Core::alloc::{ChannelPartition, SharedMemoryAllocator};
use crate::MPMC::Structs::Buffer_Structs::FrameMeta;
use crossbeam_utils::Backoff;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A producer for publishing events into a shared memory event queue.
/// The producer writes whole events into ring slots; each slot is sized to the
/// queue's maximum event length.
pub struct Producer {
    channel: ChannelPartition,
    allocator: SharedMemoryAllocator,
    max_message_size: usize,
    sequence_counter: AtomicU64,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub(crate) fn new(allocator: SharedMemoryAllocator, channel: ChannelPartition) -> Self {
        // Max message size is fixed by the slot payload of the channel
        let max_message_size = channel.buffer().slot_payload();
        Self {
            channel,
            allocator,
            max_message_size,
            sequence_counter: AtomicU64::new(0),
        }
    }

    /// Sends a message through the channel, tagging it with the next local sequence number.
    ///
    /// # Returns
    /// * `Ok(())` if the message was sent successfully
    /// * `Err(WouldBlock)` if the queue is full
    /// * `Err(InvalidInput)` if the message is larger than a slot
    /// * `Err(BrokenPipe)` if the queue owner shut the region down
    pub fn send<T: AsRef<[u8]>>(&self, message: T) -> io::Result<()> {
        let message = message.as_ref();
        let event_num = self.sequence_counter.fetch_add(1, Ordering::Relaxed);
        self.publish(FrameMeta::whole_event(event_num, 0, message.len()), message)
    }

    /// Publishes one event, requesting a free slot for at most `wait`.
    pub fn send_event(&self, event_num: u64, data_id: u16, payload: &[u8], wait: Duration) -> io::Result<()> {
        let meta = FrameMeta::whole_event(event_num, data_id, payload.len());
        let deadline = Instant::now() + wait;
        let backoff = Backoff::new();

        loop {
            match self.publish(meta, payload) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no free queue slot within {:?}", wait),
                        ));
                    }
                    if backoff.is_completed() {
                        std::thread::sleep(Duration::from_micros(100));
                    } else {
                        backoff.snooze();
                    }
                }
                other => return other,
            }
        }
    }

    fn publish(&self, meta: FrameMeta, message: &[u8]) -> io::Result<()> {
        // Check message size before attempting to enqueue
        if message.len() > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Message too large ({} > {})",
                    message.len(),
                    self.max_message_size
                ),
            ));
        }
        if self.allocator.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Event queue has been shut down",
            ));
        }

        let buffer = self.channel.buffer();
        match buffer.enqueue(meta, message) {
            Some(_) => {
                buffer.signal_consumer();
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "Failed to enqueue message - buffer full",
            )),
        }
    }

    /// Returns the maximum message size that can be sent
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Name of the region this producer writes to
    pub fn region(&self) -> &str {
        self.allocator.region_name()
    }
}
