use crossbeam_utils::CachePadded;
use event_relay::MPMC::Buffer::layout::ChannelEntry;
use event_relay::MPMC::Buffer::{slot_stride, RingBuffer};
use event_relay::MPMC::Structs::FrameMeta;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::thread;

fn create_dummy_channel_entry(capacity: u64, slot_payload: u64) -> Box<ChannelEntry> {
    Box::new(ChannelEntry {
        channel_id: 0,
        flags: 0,
        capacity,
        slot_payload,
        band_offset: 0,
        signal: AtomicU32::new(0),
        tail: CachePadded::new(AtomicU64::new(0)),
        head: CachePadded::new(AtomicU64::new(0)),
    })
}

struct Band {
    ptr: *mut u8,
    layout: Layout,
}

impl Band {
    fn new(capacity: usize, slot_payload: usize) -> Self {
        let layout = Layout::from_size_align(capacity * slot_stride(slot_payload), 128).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            panic!("Failed to allocate aligned memory");
        }
        Self { ptr, layout }
    }
}

impl Drop for Band {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

fn ring(entry: &ChannelEntry, band: &Band) -> RingBuffer {
    let rb = unsafe { RingBuffer::new(entry, band.ptr) };
    unsafe { rb.init_slots() };
    rb
}

#[test]
fn simple_enqueue_dequeue() {
    let entry = create_dummy_channel_entry(16, 64);
    let band = Band::new(16, 64);
    let rb = ring(&entry, &band);

    let meta = FrameMeta::whole_event(7, 3, 4);
    let payload = vec![1, 2, 3, 4];
    assert!(rb.enqueue(meta, &payload).is_some());
    assert_eq!(rb.len(), 1);

    let (meta_out, data) = rb.dequeue().unwrap();
    assert_eq!(data, payload);
    assert_eq!(meta_out.event_num, 7);
    assert_eq!(meta_out.data_id, 3);
    assert_eq!(meta_out.frag_len, 4);
    assert!(rb.is_empty());
}

#[test]
fn frag_len_follows_payload() {
    let entry = create_dummy_channel_entry(4, 32);
    let band = Band::new(4, 32);
    let rb = ring(&entry, &band);

    let meta = FrameMeta {
        event_len: 100,
        frag_offset: 40,
        frag_len: 999,
        ..FrameMeta::default()
    };
    rb.enqueue(meta, &[5u8; 20]).unwrap();
    let (out, data) = rb.dequeue().unwrap();
    assert_eq!(out.frag_len, 20);
    assert_eq!(out.frag_offset, 40);
    assert_eq!(data.len(), 20);
    assert!(out.is_consistent());
}

#[test]
fn oversized_payload_is_refused() {
    let entry = create_dummy_channel_entry(4, 32);
    let band = Band::new(4, 32);
    let rb = ring(&entry, &band);

    assert!(rb.enqueue(FrameMeta::default(), &[0u8; 33]).is_none());
    assert!(rb.enqueue(FrameMeta::default(), &[0u8; 32]).is_some());
    assert_eq!(rb.slot_payload(), 32);
}

#[test]
fn full_buffer() {
    let entry = create_dummy_channel_entry(4, 8);
    let band = Band::new(4, 8);
    let rb = ring(&entry, &band);

    let meta = FrameMeta::default();
    let payload = vec![0u8; 8];
    for _ in 0..4 {
        assert!(rb.enqueue(meta, &payload).is_some());
    }
    assert!(rb.enqueue(meta, &payload).is_none());
    assert!(rb.dequeue().is_some());
    assert!(rb.enqueue(meta, &payload).is_some());
}

#[test]
fn dequeue_with_reads_in_place() {
    let entry = create_dummy_channel_entry(8, 128);
    let band = Band::new(8, 128);
    let rb = ring(&entry, &band);

    rb.enqueue(FrameMeta::whole_event(1, 0, 3), b"abc").unwrap();
    let sum = rb.dequeue_with(|meta, payload| {
        assert_eq!(meta.event_num, 1);
        payload.iter().map(|b| *b as u32).sum::<u32>()
    });
    assert_eq!(sum, Some(b'a' as u32 + b'b' as u32 + b'c' as u32));
    assert!(rb.dequeue_with(|_, _| ()).is_none());
}

#[test]
fn small_mpmc_correctness() {
    let entry = create_dummy_channel_entry(8, 16);
    let band = Band::new(8, 16);
    let rb = Arc::new(ring(&entry, &band));

    thread::scope(|s| {
        let rb_prod = Arc::clone(&rb);
        s.spawn(move || {
            for i in 0..100u64 {
                let meta = FrameMeta::whole_event(i, 0, 1);
                while rb_prod.enqueue(meta, &[i as u8]).is_none() {
                    std::hint::spin_loop();
                }
            }
        });

        let rb_cons = Arc::clone(&rb);
        s.spawn(move || {
            let mut count = 0u64;
            while count < 100 {
                if let Some((meta, data)) = rb_cons.dequeue() {
                    assert_eq!(meta.event_num, count);
                    assert_eq!(data[0], count as u8);
                    count += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });
    });
}
