// Per-slot frame metadata for the bounded lock-free MPMC ring

// no atomics in FrameMeta; keep as plain integral types for ABI

/// Metadata that precedes each payload in a slot.
/// ABI-stable across processes; all fields are little-endian.
///
/// For transport frames the payload is one fragment of an event starting at
/// `frag_offset`; for the event queue the payload is a whole event and
/// `frag_offset == 0`, `frag_len == event_len`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub event_num: u64,
    pub timestamp_ns: u64,
    pub src_id: u32,
    pub data_id: u16,
    pub flags: u16,
    pub event_len: u32,
    pub frag_offset: u32,
    pub frag_len: u32,
    pub sender_pid: u32,
}

impl FrameMeta {
    /// Metadata for a payload that carries a complete event.
    pub fn whole_event(event_num: u64, data_id: u16, len: usize) -> Self {
        Self {
            event_num,
            timestamp_ns: now_ns(),
            src_id: 0,
            data_id,
            flags: 0,
            event_len: len as u32,
            frag_offset: 0,
            frag_len: len as u32,
            sender_pid: std::process::id(),
        }
    }

    /// True when the fragment lies inside the advertised event.
    pub fn is_consistent(&self) -> bool {
        (self.frag_offset as u64 + self.frag_len as u64) <= self.event_len as u64
    }
}

/// Wall-clock nanoseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
