use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::time::Duration;

use super::layout::ChannelEntry;
use super::Buffer::{slot_stride, RingBuffer, SlotHeader};
use crate::MPMC::Structs::Buffer_Structs::FrameMeta;

impl RingBuffer {
    /// Create a ring buffer view over an existing memory region.
    ///
    /// # Safety
    /// Caller must ensure `metadata` and `buffer_base` are valid pointers to shared memory,
    /// that `(*metadata).capacity` is a non-zero power of two and that the band holds
    /// `capacity` slots of `slot_stride((*metadata).slot_payload)` bytes.
    pub unsafe fn new(metadata: *const ChannelEntry, buffer_base: *mut u8) -> Self {
        let capacity = (*metadata).capacity as usize;
        let slot_payload = (*metadata).slot_payload as usize;
        Self {
            metadata,
            buffer_base,
            capacity,
            mask: capacity - 1,
            slot_payload,
            stride: slot_stride(slot_payload),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single slot accepts.
    #[inline]
    pub fn slot_payload(&self) -> usize {
        self.slot_payload
    }

    /// Approximate number of published-but-unconsumed slots.
    pub fn len(&self) -> usize {
        let (tail, head) = unsafe { ((*self.metadata).tail.load(Acquire), (*self.metadata).head.load(Acquire)) };
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initialize per-slot sequence numbers to k for k in 0..capacity.
    /// This should ONLY be called by the creator process.
    ///
    /// # Safety
    /// Caller guarantees the underlying memory is allocated and writable.
    pub unsafe fn init_slots(&self) {
        for k in 0..self.capacity {
            let slot = self.slot_mut(k);
            (*slot).sequence.store(k as u64, Relaxed);
        }
    }

    #[inline]
    unsafe fn slot_mut(&self, index: usize) -> *mut SlotHeader {
        self.buffer_base.add(index * self.stride) as *mut SlotHeader
    }

    #[inline]
    unsafe fn payload_mut(&self, slot: *mut SlotHeader) -> *mut u8 {
        (slot as *mut u8).add(size_of::<SlotHeader>())
    }

    /// Enqueue reserves a slot and publishes the frame.
    /// Returns the index on success, or None if the ring appears full or
    /// the payload does not fit in one slot.
    pub fn enqueue(&self, meta: FrameMeta, payload: &[u8]) -> Option<usize> {
        if payload.len() > self.slot_payload {
            return None;
        }
        // Safety: We assume metadata pointer is valid for the lifetime of the RingBuffer view
        let tail_atomic = unsafe { &(*self.metadata).tail };

        loop {
            let tail = tail_atomic.load(Relaxed);
            let idx = (tail as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    // We own this slot now
                    unsafe {
                        (*slot_ptr).meta = meta;
                        (*slot_ptr).meta.frag_len = payload.len() as u32;

                        ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            self.payload_mut(slot_ptr),
                            payload.len(),
                        );

                        // Publish
                        (*slot_ptr).sequence.store(tail + 1, Release);
                    }
                    return Some(idx);
                }
                continue;
            } else if dif < 0 {
                // full
                return None;
            } else {
                // another producer moved tail past us; reload and retry
                std::hint::spin_loop();
                continue;
            }
        }
    }

    /// Dequeue acquires a ready slot and hands its metadata and payload to `read`
    /// before the slot is released back to producers.
    /// Returns None if the ring appears empty.
    pub fn dequeue_with<T, F>(&self, read: F) -> Option<T>
    where
        F: FnOnce(&FrameMeta, &[u8]) -> T,
    {
        let head_atomic = unsafe { &(*self.metadata).head };

        loop {
            let head = head_atomic.load(Relaxed);
            let idx = (head as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - (head as i64 + 1);

            if dif == 0 {
                if head_atomic
                    .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    let out = unsafe {
                        let meta = (*slot_ptr).meta;
                        let len = (meta.frag_len as usize).min(self.slot_payload);
                        let payload = std::slice::from_raw_parts(self.payload_mut(slot_ptr), len);
                        read(&meta, payload)
                    };

                    // free slot for future producers
                    unsafe {
                        (*slot_ptr)
                            .sequence
                            .store(head + self.capacity as u64, Release);
                    }
                    return Some(out);
                }
                continue;
            } else if dif < 0 {
                // empty
                return None;
            } else {
                // another consumer moved head past us; reload and retry
                std::hint::spin_loop();
                continue;
            }
        }
    }

    /// Dequeue into an owned copy of the payload.
    pub fn dequeue(&self) -> Option<(FrameMeta, Vec<u8>)> {
        self.dequeue_with(|meta, payload| (*meta, payload.to_vec()))
    }

    /// Signal consumers that new data is available
    pub fn signal_consumer(&self) {
        unsafe {
            let signal = &(*self.metadata).signal;
            signal.fetch_add(1, Release);
            crate::Core::futex::futex_wake_all(signal);
        }
    }

    /// Wait (at most `timeout`) for new data to be available
    pub fn wait_for_data(&self, timeout: Duration) {
        unsafe {
            let signal = &(*self.metadata).signal;
            let val = signal.load(Acquire);
            if !self.is_empty() {
                return;
            }
            crate::Core::futex::futex_wait_timeout(signal, val, timeout);
        }
    }
}
