//! Loopback transport over a shared memory frame ring.
//!
//! The receiving side owns the region: it creates a single channel of
//! fixed-size frame slots and runs worker threads that stitch fragments back
//! into events. Senders attach to that region, cut every unit into frames no
//! larger than the MTU and push them through the ring.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    DestinationUri, LostEvent, Reassembler, ReassemblerStats, ReceivedEvent, Rejection, Segmenter,
    SendStats, Submission, TransmissionUnit,
};
use crate::error::TransportError;
use crate::Core::alloc::{region_size, ChannelPartition, SharedMemoryAllocator};
use crate::MPMC::Structs::Buffer_Structs::{now_ns, FrameMeta};

/// Payload bytes per frame slot; the largest MTU a sender may use.
pub const FRAME_SLOT_PAYLOAD: usize = 9000;

/// Bytes of every frame taken by its metadata.
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameMeta>();

// A frame that cannot be placed within this window is a send error.
const FRAME_STALL_LIMIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive-side settings.
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    pub listen: IpAddr,
    pub port: u16,
    pub threads: usize,
    /// Partial events older than this are declared lost.
    pub event_timeout: Duration,
    /// Completed events waiting for `recv_event`.
    pub event_queue_depth: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 19522,
            threads: 1,
            event_timeout: Duration::from_millis(500),
            event_queue_depth: 1024,
        }
    }
}

/// Send-side settings.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub mtu: usize,
    /// Gbps; zero or negative means unpaced.
    pub rate_gbps: f64,
    /// Units accepted but not yet picked up by a send thread.
    pub queue_depth: usize,
    pub send_threads: usize,
    pub use_control_plane: bool,
    pub skip_cert_validation: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            rate_gbps: 1.0,
            queue_depth: 64,
            send_threads: 4,
            use_control_plane: false,
            skip_cert_validation: false,
        }
    }
}

fn connect_error(uri: &DestinationUri, source: io::Error) -> TransportError {
    TransportError::Connect {
        target: uri.to_string(),
        source,
    }
}

#[derive(Debug, Default)]
struct ReassemblyCounters {
    total_packets: AtomicU64,
    total_bytes: AtomicU64,
    event_success: AtomicU64,
    reassembly_loss: AtomicU64,
    enqueue_loss: AtomicU64,
    data_errors: AtomicU64,
    control_errors: AtomicU64,
}

impl ReassemblyCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReassemblerStats {
        ReassemblerStats {
            total_packets: self.total_packets.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            event_success: self.event_success.load(Ordering::Relaxed),
            reassembly_loss: self.reassembly_loss.load(Ordering::Relaxed),
            enqueue_loss: self.enqueue_loss.load(Ordering::Relaxed),
            data_errors: self.data_errors.load(Ordering::Relaxed),
            control_errors: self.control_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EventKey {
    event_num: u64,
    data_id: u16,
    src_id: u32,
}

struct PartialEvent {
    data: Vec<u8>,
    filled: usize,
    offsets: BTreeSet<u32>,
    first_seen: Instant,
}

impl PartialEvent {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            filled: 0,
            offsets: BTreeSet::new(),
            first_seen: Instant::now(),
        }
    }
}

struct ReceiverShared {
    region: SharedMemoryAllocator,
    frames: ChannelPartition,
    running: AtomicBool,
    event_timeout: Duration,
    sweep_interval: Duration,
    partial: Mutex<HashMap<EventKey, PartialEvent>>,
    last_sweep: Mutex<Instant>,
    lost: Mutex<VecDeque<LostEvent>>,
    counters: ReassemblyCounters,
}

impl ReceiverShared {
    /// Fold one frame into its event; returns the event once every byte arrived.
    fn absorb(&self, meta: &FrameMeta, payload: &[u8]) -> Option<ReceivedEvent> {
        self.counters.total_packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if !meta.is_consistent() || payload.len() != meta.frag_len as usize {
            ReassemblyCounters::bump(&self.counters.data_errors);
            return None;
        }

        let key = EventKey {
            event_num: meta.event_num,
            data_id: meta.data_id,
            src_id: meta.src_id,
        };
        let event_len = meta.event_len as usize;

        let mut partial = self.partial.lock();
        let entry = partial
            .entry(key)
            .or_insert_with(|| PartialEvent::new(event_len));
        if entry.data.len() != event_len {
            ReassemblyCounters::bump(&self.counters.data_errors);
            return None;
        }
        if !entry.offsets.insert(meta.frag_offset) {
            // duplicate fragment
            return None;
        }
        let start = meta.frag_offset as usize;
        entry.data[start..start + payload.len()].copy_from_slice(payload);
        entry.filled += payload.len();
        if entry.filled < event_len {
            return None;
        }

        let done = partial.remove(&key)?;
        drop(partial);
        ReassemblyCounters::bump(&self.counters.event_success);
        Some(ReceivedEvent {
            data: done.data,
            event_num: key.event_num,
            data_id: key.data_id,
        })
    }

    fn deliver(&self, events: &Sender<ReceivedEvent>, event: ReceivedEvent) {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                ReassemblyCounters::bump(&self.counters.enqueue_loss);
                debug!(event = event.event_num, "event queue full; dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Declare partial events lost once they sat longer than the timeout.
    fn sweep_expired(&self) {
        let now = Instant::now();
        {
            let Some(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if now.duration_since(*last) < self.sweep_interval {
                return;
            }
            *last = now;
        }
        let timeout = self.event_timeout;
        self.retire(|p| now.duration_since(p.first_seen) >= timeout);
    }

    fn retire<F: Fn(&PartialEvent) -> bool>(&self, expired: F) {
        let mut partial = self.partial.lock();
        let mut lost = self.lost.lock();
        partial.retain(|key, p| {
            if !expired(p) {
                return true;
            }
            ReassemblyCounters::bump(&self.counters.reassembly_loss);
            lost.push_back(LostEvent {
                event_num: key.event_num,
                data_id: key.data_id,
                frags: p.offsets.len() as u32,
            });
            false
        });
    }
}

fn reassembly_worker(shared: Arc<ReceiverShared>, events: Sender<ReceivedEvent>, index: usize) {
    debug!(worker = index, "reassembly worker started");
    let ring = shared.frames.buffer();
    let idle_wait = POLL_INTERVAL.min(shared.sweep_interval);

    while shared.running.load(Ordering::Acquire) {
        match ring.dequeue_with(|meta, payload| shared.absorb(meta, payload)) {
            Some(Some(event)) => shared.deliver(&events, event),
            Some(None) => {}
            None => ring.wait_for_data(idle_wait),
        }
        shared.sweep_expired();
    }
    debug!(worker = index, "reassembly worker stopped");
}

/// Receive half of the loopback transport. Owns (and finally unlinks) the region.
pub struct ShmReassembler {
    shared: Arc<ReceiverShared>,
    events: Receiver<ReceivedEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShmReassembler {
    pub fn open_and_start(
        uri: &DestinationUri,
        config: &ReassemblerConfig,
    ) -> Result<Self, TransportError> {
        let size = region_size(1, uri.slots(), FRAME_SLOT_PAYLOAD);
        let region = SharedMemoryAllocator::create(uri.region(), size)
            .map_err(|e| connect_error(uri, e))?;
        let frames = region
            .create_channel(uri.slots(), FRAME_SLOT_PAYLOAD)
            .map_err(|e| connect_error(uri, e))?;

        let event_timeout = config.event_timeout.max(Duration::from_millis(1));
        let shared = Arc::new(ReceiverShared {
            region,
            frames,
            running: AtomicBool::new(true),
            event_timeout,
            sweep_interval: (event_timeout / 4).max(Duration::from_millis(1)),
            partial: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            lost: Mutex::new(VecDeque::new()),
            counters: ReassemblyCounters::default(),
        });

        let (tx, rx) = bounded(config.event_queue_depth.max(1));
        let reassembler = Self {
            shared,
            events: rx,
            workers: Mutex::new(Vec::new()),
        };

        for index in 0..config.threads.max(1) {
            let shared = Arc::clone(&reassembler.shared);
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("reassembler-{index}"))
                .spawn(move || reassembly_worker(shared, tx, index))
                // Dropping `reassembler` stops the workers spawned so far
                .map_err(|e| connect_error(uri, e))?;
            reassembler.workers.lock().push(handle);
        }

        info!(
            region = uri.region(),
            slots = uri.slots(),
            listen = %config.listen,
            port = config.port,
            threads = config.threads.max(1),
            "reassembler started"
        );
        Ok(reassembler)
    }

    /// Partial events currently waiting for fragments.
    pub fn pending_events(&self) -> usize {
        self.shared.partial.lock().len()
    }
}

impl Reassembler for ShmReassembler {
    fn recv_event(&self, timeout: Duration) -> Result<Option<ReceivedEvent>, TransportError> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Unusable(
                "reassembly workers have stopped".into(),
            )),
        }
    }

    fn stats(&self) -> ReassemblerStats {
        self.shared.counters.snapshot()
    }

    fn lost_event(&self) -> Option<LostEvent> {
        self.shared.lost.lock().pop_front()
    }

    fn register_worker(&self, hostname: &str) -> Result<(), TransportError> {
        let workers = self.shared.region.register_worker();
        info!(hostname, workers, "worker registered");
        Ok(())
    }

    fn deregister_worker(&self) -> Result<(), TransportError> {
        match self.shared.region.deregister_worker() {
            Ok(workers) => {
                info!(workers, "worker deregistered");
                Ok(())
            }
            Err(e) => {
                ReassemblyCounters::bump(&self.shared.counters.control_errors);
                Err(TransportError::Registration(e.to_string()))
            }
        }
    }

    fn stop_threads(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.frames.buffer().signal_consumer();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("reassembly worker panicked");
            }
        }
        // Nothing completes these any more
        self.shared.retire(|_| true);
    }
}

impl Drop for ShmReassembler {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

/// Spreads frame sends over time to stay under a bit rate.
#[derive(Debug)]
struct Pacer {
    ns_per_byte: f64,
    next: Mutex<Instant>,
}

impl Pacer {
    fn new(rate_gbps: f64) -> Self {
        let ns_per_byte = if rate_gbps.is_finite() && rate_gbps > 0.0 {
            8.0 / rate_gbps
        } else {
            0.0
        };
        Self {
            ns_per_byte,
            next: Mutex::new(Instant::now()),
        }
    }

    fn pace(&self, bytes: usize) {
        if self.ns_per_byte <= 0.0 {
            return;
        }
        let cost = Duration::from_nanos((bytes as f64 * self.ns_per_byte) as u64);
        let start = {
            let mut next = self.next.lock();
            let start = (*next).max(Instant::now());
            *next = start + cost;
            start
        };
        let now = Instant::now();
        if start > now {
            std::thread::sleep(start - now);
        }
    }
}

struct SenderShared {
    region: SharedMemoryAllocator,
    frames: ChannelPartition,
    frame_payload: usize,
    pid: u32,
    frames_sent: AtomicU64,
    errors: AtomicU64,
    pacer: Pacer,
}

impl SenderShared {
    fn transmit(&self, unit: &TransmissionUnit) {
        let payload = unit.payload();
        let mut meta = FrameMeta {
            event_num: unit.buffer_id(),
            timestamp_ns: now_ns(),
            src_id: unit.src_id(),
            data_id: unit.data_id(),
            flags: 0,
            event_len: payload.len() as u32,
            frag_offset: 0,
            frag_len: 0,
            sender_pid: self.pid,
        };

        let mut offset = 0;
        loop {
            let end = (offset + self.frame_payload).min(payload.len());
            let frag = &payload[offset..end];
            meta.frag_offset = offset as u32;
            meta.frag_len = frag.len() as u32;

            self.pacer.pace(frag.len() + FRAME_HEADER_LEN);
            if let Err(e) = self.push_frame(&meta, frag) {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(buffer = unit.buffer_id(), offset, error = %e, "dropping rest of buffer");
                return;
            }
            self.frames_sent.fetch_add(1, Ordering::Relaxed);

            offset = end;
            if offset >= payload.len() {
                return;
            }
        }
    }

    fn push_frame(&self, meta: &FrameMeta, frag: &[u8]) -> io::Result<()> {
        let ring = self.frames.buffer();
        let deadline = Instant::now() + FRAME_STALL_LIMIT;
        let backoff = Backoff::new();

        loop {
            if self.region.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "receiver closed the frame ring",
                ));
            }
            if ring.enqueue(*meta, frag).is_some() {
                ring.signal_consumer();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("frame ring full for {:?}", FRAME_STALL_LIMIT),
                ));
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }
    }
}

fn send_worker(shared: Arc<SenderShared>, queue: Receiver<TransmissionUnit>, index: usize) {
    debug!(thread = index, "send thread started");
    for unit in queue.iter() {
        shared.transmit(&unit);
        // dropping the unit releases the batch
    }
    debug!(thread = index, "send thread stopped");
}

/// Send half of the loopback transport.
pub struct ShmSegmenter {
    queue: Option<Sender<TransmissionUnit>>,
    shared: Arc<SenderShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ShmSegmenter {
    pub fn open_and_start(
        uri: &DestinationUri,
        config: &SegmenterConfig,
    ) -> Result<Self, TransportError> {
        let region =
            SharedMemoryAllocator::attach(uri.region()).map_err(|e| connect_error(uri, e))?;
        let frames = region.get_channel(0).ok_or_else(|| {
            connect_error(
                uri,
                io::Error::new(io::ErrorKind::NotFound, "frame ring not initialised"),
            )
        })?;

        let frame_payload = config
            .mtu
            .saturating_sub(FRAME_HEADER_LEN)
            .min(frames.buffer().slot_payload());
        if frame_payload == 0 {
            return Err(connect_error(
                uri,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("MTU {} leaves no room for payload", config.mtu),
                ),
            ));
        }

        if config.skip_cert_validation {
            info!("certificate validation disabled (no TLS on the shared memory path)");
        }
        if config.use_control_plane {
            let senders = region.register_sender();
            info!(senders, "sender registered with control plane");
        }

        let shared = Arc::new(SenderShared {
            region,
            frames,
            frame_payload,
            pid: std::process::id(),
            frames_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            pacer: Pacer::new(config.rate_gbps),
        });

        let (tx, rx) = bounded(config.queue_depth.max(1));
        let mut segmenter = Self {
            queue: Some(tx),
            shared,
            threads: Vec::new(),
        };
        for index in 0..config.send_threads.max(1) {
            let shared = Arc::clone(&segmenter.shared);
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("segmenter-{index}"))
                .spawn(move || send_worker(shared, rx, index))
                .map_err(|e| connect_error(uri, e))?;
            segmenter.threads.push(handle);
        }

        info!(
            region = uri.region(),
            mtu = config.mtu,
            frame_payload,
            rate_gbps = config.rate_gbps,
            "segmenter started"
        );
        Ok(segmenter)
    }

    /// Stop accepting units, transmit what is queued and join the send threads.
    pub fn close(&mut self) {
        self.queue.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("send thread panicked");
            }
        }
    }
}

impl Segmenter for ShmSegmenter {
    fn add_to_send_queue(&self, unit: TransmissionUnit) -> Submission {
        let Some(queue) = &self.queue else {
            return Submission::Rejected {
                unit,
                reason: Rejection::Failed(TransportError::QueueClosed),
            };
        };
        if self.shared.region.is_closed() {
            return Submission::Rejected {
                unit,
                reason: Rejection::Failed(TransportError::Unusable(
                    "receiver closed the frame ring".into(),
                )),
            };
        }
        if unit.len() > u32::MAX as usize {
            let len = unit.len();
            return Submission::Rejected {
                unit,
                reason: Rejection::Failed(TransportError::Rejected {
                    len,
                    reason: "larger than the 4 GiB event limit".into(),
                }),
            };
        }

        match queue.try_send(unit) {
            Ok(()) => Submission::Accepted,
            Err(TrySendError::Full(unit)) => Submission::Rejected {
                unit,
                reason: Rejection::QueueFull,
            },
            Err(TrySendError::Disconnected(unit)) => Submission::Rejected {
                unit,
                reason: Rejection::Failed(TransportError::QueueClosed),
            },
        }
    }

    fn send_stats(&self) -> SendStats {
        SendStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
        }
    }

    fn max_payload_length(&self) -> usize {
        self.shared.frame_payload
    }
}

impl Drop for ShmSegmenter {
    fn drop(&mut self) {
        self.close();
    }
}
