use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// The maximum number of channels that can be configured in one region.
/// This must be a constant to allow for a fixed-size array in the GlobalHeader.
pub const MAX_CHANNELS: usize = 16;

/// Defines the metadata for a single MPMC channel within the global header.
///
/// This struct contains the atomic cursors and layout information necessary
/// to manage one channel's ring buffer. By centralizing these here, we keep
/// the control plane separate from the data plane.
#[repr(C, align(128))]
pub struct ChannelEntry {
    /// Logical identifier.
    pub channel_id: u32,

    /// Per-channel flags (reserved).
    pub flags: u32,

    /// The capacity of this channel's ring buffer in number of slots.
    /// Always a power of two; zero marks an unused entry.
    pub capacity: u64,

    /// Maximum payload bytes one slot can carry.
    pub slot_payload: u64,

    /// The byte offset from the start of the shared memory region to the
    /// beginning of this channel's data band (its ring buffer).
    pub band_offset: u64,

    /// Signal word for futex-based blocking/waking.
    /// Producers bump and wake, consumers wait on this.
    pub signal: AtomicU32,

    /// The "tail" cursor for producers. Atomically incremented to claim a slot for writing.
    /// Padded to prevent false sharing with adjacent channel metadata.
    pub tail: CachePadded<AtomicU64>,

    /// The "head" cursor for consumers. Atomically incremented to claim a slot for reading.
    /// Padded to prevent false sharing with adjacent channel metadata.
    pub head: CachePadded<AtomicU64>,
}

/// The global header located at the very beginning of the shared memory region.
///
/// It acts as the entry point for any process, containing versioning info,
/// the registration counters used as a control plane, and the table of
/// channel entries.
#[repr(C, align(128))]
pub struct GlobalHeader {
    /// A "magic number" to identify the memory region as an event-relay region.
    pub magic: u64,

    /// The version of the memory layout.
    pub version: u32,

    /// Compiled/allocated maximum channel entries.
    pub max_channels: u32,

    /// The number of channels currently active and configured.
    pub channel_count: AtomicU32,

    /// Set to non-zero by the creator when it shuts the region down.
    pub closed: AtomicU32,

    /// Senders registered through the control plane.
    pub senders: AtomicU32,

    /// Receive workers registered through the control plane.
    pub workers: AtomicU32,

    /// Process that created the region. A dead creator leaves a stale region.
    pub owner_pid: AtomicU32,

    /// The table of metadata for each channel.
    pub channels: [ChannelEntry; MAX_CHANNELS],
}
