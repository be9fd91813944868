// End-to-end runs of the shared memory loopback transport.
#![cfg(target_os = "linux")]

use std::time::{Duration, Instant};

use serial_test::serial;

use event_relay::error::TransportError;
use event_relay::Core::alloc::SharedMemoryAllocator;
use event_relay::Source::{MemorySource, SyntheticSource};
use event_relay::Stream::record::{records, FourVector, PhysicsEvent, RECORD_SIZE};
use event_relay::Stream::{
    DispatchSettings, Dispatcher, InFlightLimit, LoopState, ReceiveLoop, ReceiveSettings,
    RetryPolicy, RunContext, SendGate, StreamTag,
};
use event_relay::Stream::EventSink;
use event_relay::Transport::shm::FRAME_HEADER_LEN;
use event_relay::MPMC::Structs::FrameMeta;
use event_relay::Transport::{
    DestinationUri, Reassembler, ReassemblerConfig, ReceivedEvent, Segmenter, SegmenterConfig,
    ShmReassembler, ShmSegmenter,
};

fn uri(name: &str) -> DestinationUri {
    DestinationUri::parse(&format!(
        "shm://relay_transport_{}_{}?slots=64",
        name,
        std::process::id()
    ))
    .unwrap()
}

fn unpaced() -> SegmenterConfig {
    SegmenterConfig {
        rate_gbps: 0.0,
        send_threads: 2,
        ..SegmenterConfig::default()
    }
}

fn collect(reassembler: &ShmReassembler, n: usize) -> Vec<ReceivedEvent> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::new();
    while out.len() < n && Instant::now() < deadline {
        if let Some(ev) = reassembler.recv_event(Duration::from_millis(100)).unwrap() {
            out.push(ev);
        }
    }
    out
}

#[test]
#[serial]
fn batches_arrive_whole_and_intact() {
    let uri = uri("whole");
    let reassembler = ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()).unwrap();
    let segmenter = ShmSegmenter::open_and_start(&uri, &unpaced()).unwrap();
    assert_eq!(segmenter.max_payload_length(), 1500 - FRAME_HEADER_LEN);

    let ctx = RunContext::new();
    let gate = SendGate::new(
        &segmenter,
        &ctx,
        RetryPolicy::default(),
        InFlightLimit::new(8),
        StreamTag {
            data_id: 3,
            src_id: 1,
        },
    );
    let events: Vec<PhysicsEvent> = (0..100)
        .map(|i| PhysicsEvent {
            pi_minus: FourVector::new(i as f64, -1.0, 0.5, 2.0),
            ..Default::default()
        })
        .collect();
    let settings = DispatchSettings {
        batch_records: 30,
        ..DispatchSettings::default()
    };
    let summary = Dispatcher::new(&ctx, &gate, settings).run(vec![MemorySource::new("mem", events.clone())]);
    assert!(summary.all_succeeded());
    assert!(summary.drained);
    assert_eq!(summary.buffers_submitted, 4);

    let mut received = collect(&reassembler, 4);
    assert_eq!(received.len(), 4);
    received.sort_by_key(|ev| ev.event_num);
    assert_eq!(
        received.iter().map(|ev| ev.event_num).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert!(received.iter().all(|ev| ev.data_id == 3));
    let replayed: Vec<PhysicsEvent> = received.iter().flat_map(|ev| records(&ev.data)).collect();
    assert_eq!(replayed, events);

    // 30 records = 3840 bytes = 3 frames of at most 1460 bytes
    let stats = segmenter.send_stats();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.frames_sent, 3 + 3 + 3 + 1);
    let rx = reassembler.stats();
    assert_eq!(rx.event_success, 4);
    assert_eq!(rx.total_bytes, 100 * RECORD_SIZE as u64);
    assert_eq!(reassembler.pending_events(), 0);
    assert!(reassembler.lost_event().is_none());
}

#[test]
#[serial]
fn receive_loop_writes_every_event() {
    struct Counting(Vec<usize>);
    impl EventSink for Counting {
        fn write(&mut self, event: &ReceivedEvent) -> Result<(), event_relay::error::SinkError> {
            self.0.push(event.len());
            Ok(())
        }
    }

    let uri = uri("loop");
    let reassembler = ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()).unwrap();
    let segmenter = ShmSegmenter::open_and_start(&uri, &unpaced()).unwrap();

    let send_ctx = RunContext::new();
    let gate = SendGate::new(
        &segmenter,
        &send_ctx,
        RetryPolicy::default(),
        InFlightLimit::new(4),
        StreamTag {
            data_id: 1,
            src_id: 1,
        },
    );
    let settings = DispatchSettings {
        batch_records: 100,
        ..DispatchSettings::default()
    };
    let summary = Dispatcher::new(&send_ctx, &gate, settings).run(vec![
        SyntheticSource::new("a", 250, 1),
        SyntheticSource::new("b", 250, 2),
    ]);
    assert_eq!(summary.buffers_submitted, 6);

    let recv_ctx = RunContext::new();
    let mut sink = Counting(Vec::new());
    let mut rx = ReceiveLoop::new(
        &recv_ctx,
        &reassembler,
        &mut sink,
        ReceiveSettings {
            recv_timeout: Duration::from_millis(200),
            ..ReceiveSettings::default()
        },
    );
    let deadline = Instant::now() + Duration::from_secs(10);
    while rx.stats().snapshot().written < 6 && Instant::now() < deadline {
        rx.step();
    }
    recv_ctx.request_stop();
    while rx.step() != LoopState::Stopped {}
    drop(rx);

    let mut sizes = sink.0;
    sizes.sort_unstable();
    assert_eq!(
        sizes,
        vec![50, 50, 100, 100, 100, 100]
            .into_iter()
            .map(|n| n * RECORD_SIZE)
            .collect::<Vec<_>>()
    );
}

#[test]
#[serial]
fn segmenter_needs_a_receiver() {
    let err = ShmSegmenter::open_and_start(&uri("absent"), &unpaced())
        .err()
        .expect("no region to attach to");
    assert!(matches!(err, TransportError::Connect { .. }));
}

#[test]
#[serial]
fn incomplete_events_are_declared_lost() {
    let uri = uri("lost");
    let config = ReassemblerConfig {
        event_timeout: Duration::from_millis(40),
        ..ReassemblerConfig::default()
    };
    let reassembler = ShmReassembler::open_and_start(&uri, &config).unwrap();

    // Only the first half of a 200-byte event ever arrives
    let peer = SharedMemoryAllocator::attach(uri.region()).unwrap();
    let ring = peer.get_channel(0).unwrap();
    let meta = FrameMeta {
        event_num: 77,
        data_id: 5,
        event_len: 200,
        frag_offset: 0,
        frag_len: 100,
        ..FrameMeta::default()
    };
    assert!(ring.buffer().enqueue(meta, &[1u8; 100]).is_some());
    ring.buffer().signal_consumer();

    let deadline = Instant::now() + Duration::from_secs(5);
    let lost = loop {
        if let Some(lost) = reassembler.lost_event() {
            break Some(lost);
        }
        if Instant::now() > deadline {
            break None;
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    let lost = lost.expect("partial event expires");
    assert_eq!((lost.event_num, lost.data_id, lost.frags), (77, 5, 1));
    assert!(reassembler.lost_event().is_none());
    assert_eq!(reassembler.stats().reassembly_loss, 1);
    assert_eq!(reassembler.recv_event(Duration::from_millis(10)).unwrap(), None);
}

#[test]
#[serial]
fn stopped_reassembler_reports_unusable() {
    let uri = uri("stopped");
    let reassembler = ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()).unwrap();
    reassembler.register_worker("localhost").unwrap();
    reassembler.deregister_worker().unwrap();
    assert!(matches!(
        reassembler.deregister_worker(),
        Err(TransportError::Registration(_))
    ));
    assert_eq!(reassembler.stats().control_errors, 1);

    reassembler.stop_threads();
    reassembler.stop_threads();
    let err = reassembler.recv_event(Duration::from_millis(10)).unwrap_err();
    assert!(err.is_unrecoverable());
}

#[test]
#[serial]
fn closed_segmenter_refuses_units() {
    let uri = uri("closed");
    let _reassembler = ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()).unwrap();
    let mut segmenter = ShmSegmenter::open_and_start(&uri, &unpaced()).unwrap();
    segmenter.close();

    let ctx = RunContext::new();
    let gate = SendGate::new(
        &segmenter,
        &ctx,
        RetryPolicy::default(),
        InFlightLimit::new(1),
        StreamTag {
            data_id: 1,
            src_id: 1,
        },
    );
    let summary = Dispatcher::new(&ctx, &gate, DispatchSettings::default())
        .run(vec![SyntheticSource::new("s", 3, 9)]);
    assert_eq!(summary.failed(), 1);
    assert_eq!(gate.in_flight(), 0);
}

#[test]
#[serial]
fn partials_left_at_shutdown_are_reported() {
    struct Discard;
    impl EventSink for Discard {
        fn write(&mut self, _event: &ReceivedEvent) -> Result<(), event_relay::error::SinkError> {
            Ok(())
        }
    }

    let uri = uri("shutdown");
    let config = ReassemblerConfig {
        event_timeout: Duration::from_secs(30),
        ..ReassemblerConfig::default()
    };
    let reassembler = ShmReassembler::open_and_start(&uri, &config).unwrap();

    let peer = SharedMemoryAllocator::attach(uri.region()).unwrap();
    let ring = peer.get_channel(0).unwrap();
    let meta = FrameMeta {
        event_num: 9,
        data_id: 1,
        event_len: 200,
        frag_offset: 0,
        frag_len: 100,
        ..FrameMeta::default()
    };
    assert!(ring.buffer().enqueue(meta, &[2u8; 100]).is_some());
    ring.buffer().signal_consumer();

    let deadline = Instant::now() + Duration::from_secs(5);
    while reassembler.pending_events() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(reassembler.pending_events(), 1);

    let ctx = RunContext::new();
    ctx.request_stop();
    let report = ReceiveLoop::new(&ctx, &reassembler, &mut Discard, ReceiveSettings::default()).run();

    assert_eq!(
        report.lost,
        vec![event_relay::Transport::LostEvent {
            event_num: 9,
            data_id: 1,
            frags: 1,
        }]
    );
    assert_eq!(report.transport.reassembly_loss, 1);
    assert!(reassembler.lost_event().is_none());
    assert_eq!(reassembler.pending_events(), 0);
}

#[test]
#[serial]
fn second_receiver_on_a_live_uri_is_refused() {
    let uri = uri("twice");
    let first = ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()).unwrap();

    match ShmReassembler::open_and_start(&uri, &ReassemblerConfig::default()) {
        Err(TransportError::Connect { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists)
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("second receiver took over a live region"),
    }

    // Senders still reach the first receiver
    let segmenter = ShmSegmenter::open_and_start(&uri, &unpaced()).unwrap();
    let ctx = RunContext::new();
    let gate = SendGate::new(
        &segmenter,
        &ctx,
        RetryPolicy::default(),
        InFlightLimit::new(2),
        StreamTag {
            data_id: 2,
            src_id: 1,
        },
    );
    let summary = Dispatcher::new(&ctx, &gate, DispatchSettings::default())
        .run(vec![SyntheticSource::new("s", 5, 3)]);
    assert!(summary.all_succeeded());
    let received = collect(&first, 1);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].len(), 5 * RECORD_SIZE);
}
