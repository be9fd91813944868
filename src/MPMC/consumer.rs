use crate::Core::alloc::{ChannelPartition, SharedMemoryAllocator};
use crate::MPMC::Structs::Buffer_Structs::FrameMeta;
use std::io;
use std::time::{Duration, Instant};

/// A consumer for taking events out of a shared memory event queue.
/// When the consumer created the region it also owns its lifetime: dropping it
/// shuts the region down and unlinks it.
pub struct Consumer {
    channel: ChannelPartition,
    allocator: SharedMemoryAllocator,
}

impl Consumer {
    pub(crate) fn new(allocator: SharedMemoryAllocator, channel: ChannelPartition) -> Self {
        Self { channel, allocator }
    }

    /// Receives a message from the channel if one is available.
    ///
    /// # Returns
    /// * `Ok(Some(data))` if a message was received
    /// * `Ok(None)` if no message is available
    /// * `Err(io::Error)` if the region was shut down and is drained
    pub fn receive(&self) -> io::Result<Option<Vec<u8>>> {
        self.receive_with_meta()
            .map(|opt| opt.map(|(_, payload)| payload))
    }

    /// Receives a message and metadata from the channel if one is available.
    pub fn receive_with_meta(&self) -> io::Result<Option<(FrameMeta, Vec<u8>)>> {
        match self.channel.buffer().dequeue() {
            Some(frame) => Ok(Some(frame)),
            None => {
                if self.allocator.is_closed() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "Event queue has been shut down",
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Receives a message and metadata, waiting up to the specified timeout.
    ///
    /// # Returns
    /// * `Ok(Some(frame))` if a message was received
    /// * `Ok(None)` if the timeout was reached
    /// * `Err(io::Error)` if the region was shut down
    pub fn receive_timeout_with_meta(
        &self,
        timeout: Duration,
    ) -> io::Result<Option<(FrameMeta, Vec<u8>)>> {
        let start = Instant::now();

        loop {
            if let Some(frame) = self.receive_with_meta()? {
                return Ok(Some(frame));
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Park on the futex; producers wake us after every publish
            self.channel
                .buffer()
                .wait_for_data(remaining.min(Duration::from_millis(100)));
        }
    }

    /// Largest event the queue accepts
    pub fn max_message_size(&self) -> usize {
        self.channel.buffer().slot_payload()
    }

    /// Name of the region this consumer reads from
    pub fn region(&self) -> &str {
        self.allocator.region_name()
    }
}
