//! Output sinks for reassembled events

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use super::pattern::OutputPattern;
use crate::error::SinkError;
use crate::MPMC::{ChannelBuilder, Producer};
use crate::Transport::ReceivedEvent;

/// Where the receive loop puts each event.
pub trait EventSink {
    fn write(&mut self, event: &ReceivedEvent) -> Result<(), SinkError>;
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn write(&mut self, event: &ReceivedEvent) -> Result<(), SinkError> {
        (**self).write(event)
    }
}

/// Write `data` to `path` through a shared mapping and sync it to disk.
/// The file ends up exactly `data.len()` bytes long.
#[cfg(target_os = "linux")]
pub fn write_file_mapped(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(data.len() as u64)?;
    if data.is_empty() {
        return Ok(());
    }

    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            data.len(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
        let synced = if libc::msync(ptr, data.len(), libc::MS_SYNC) != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        libc::munmap(ptr, data.len());
        synced
    }
}

#[cfg(not(target_os = "linux"))]
pub fn write_file_mapped(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// One file per event, named by the event number.
#[derive(Debug, Clone)]
pub struct FileSink {
    pattern: OutputPattern,
}

impl FileSink {
    pub fn new(pattern: OutputPattern) -> Self {
        Self { pattern }
    }

    pub fn path_for(&self, event_num: u64) -> PathBuf {
        self.pattern.path_for(event_num)
    }
}

impl EventSink for FileSink {
    fn write(&mut self, event: &ReceivedEvent) -> Result<(), SinkError> {
        let path = self.path_for(event.event_num);
        write_file_mapped(&path, &event.data).map_err(|source| SinkError::File { path, source })
    }
}

/// Republishes events into a shared memory event queue.
pub struct QueueSink {
    producer: Producer,
    max_event_size: usize,
    slot_wait: Duration,
}

impl QueueSink {
    /// Attach to the queue `region`, waiting up to `open_wait` for it to appear.
    pub fn attach(
        region: &str,
        max_event_size: usize,
        open_wait: Duration,
        slot_wait: Duration,
    ) -> Result<Self, SinkError> {
        let producer = ChannelBuilder::new()
            .with_region(region)
            .with_open_wait(open_wait)
            .build_producer()
            .map_err(SinkError::Queue)?;
        Self::from_producer(producer, max_event_size, slot_wait)
    }

    pub fn from_producer(
        producer: Producer,
        max_event_size: usize,
        slot_wait: Duration,
    ) -> Result<Self, SinkError> {
        if max_event_size > producer.max_message_size() {
            return Err(SinkError::TooLarge {
                len: max_event_size,
                max: producer.max_message_size(),
            });
        }
        info!(
            region = producer.region(),
            max_event_size,
            "attached to event queue"
        );
        Ok(Self {
            producer,
            max_event_size,
            slot_wait,
        })
    }
}

impl EventSink for QueueSink {
    fn write(&mut self, event: &ReceivedEvent) -> Result<(), SinkError> {
        if event.len() > self.max_event_size {
            return Err(SinkError::TooLarge {
                len: event.len(),
                max: self.max_event_size,
            });
        }
        self.producer
            .send_event(event.event_num, event.data_id, &event.data, self.slot_wait)
            .map_err(SinkError::Queue)
    }
}
