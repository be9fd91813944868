use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;

use event_relay::error::{SinkError, TransportError};
use event_relay::Stream::stats::render_lost;
use event_relay::Stream::{
    EventSink, FileSink, LoopState, LossReporter, OutputPattern, ReceiveLoop, ReceiveSettings,
    RunContext,
};
use event_relay::Transport::{LostEvent, Reassembler, ReassemblerStats, ReceivedEvent};

enum Step {
    Timeout,
    Event(ReceivedEvent),
    Error(TransportError),
}

/// Replays a script of receive outcomes; an exhausted script keeps timing out.
#[derive(Default)]
struct ScriptedReassembler {
    script: Mutex<VecDeque<Step>>,
    lost: Mutex<VecDeque<LostEvent>>,
    // Moved to `lost` when the threads stop
    partial: Mutex<Vec<LostEvent>>,
    calls: Mutex<u32>,
    stops: Mutex<u32>,
}

impl ScriptedReassembler {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn with_lost(self, lost: Vec<LostEvent>) -> Self {
        *self.lost.lock() = lost.into();
        self
    }

    fn with_partial(self, partial: Vec<LostEvent>) -> Self {
        *self.partial.lock() = partial;
        self
    }
}

impl Reassembler for ScriptedReassembler {
    fn recv_event(&self, _timeout: Duration) -> Result<Option<ReceivedEvent>, TransportError> {
        *self.calls.lock() += 1;
        match self.script.lock().pop_front() {
            None | Some(Step::Timeout) => Ok(None),
            Some(Step::Event(event)) => Ok(Some(event)),
            Some(Step::Error(e)) => Err(e),
        }
    }

    fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            event_success: 1,
            ..Default::default()
        }
    }

    fn lost_event(&self) -> Option<LostEvent> {
        self.lost.lock().pop_front()
    }

    fn register_worker(&self, _hostname: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn deregister_worker(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn stop_threads(&self) {
        *self.stops.lock() += 1;
        let partial = std::mem::take(&mut *self.partial.lock());
        self.lost.lock().extend(partial);
    }
}

/// Keeps events in memory and fails the ones listed in `fail`.
#[derive(Default)]
struct MemorySink {
    written: Vec<u64>,
    fail: Vec<u64>,
}

impl EventSink for MemorySink {
    fn write(&mut self, event: &ReceivedEvent) -> Result<(), SinkError> {
        if self.fail.contains(&event.event_num) {
            return Err(SinkError::File {
                path: PathBuf::from(format!("/readonly/{}", event.event_num)),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        self.written.push(event.event_num);
        Ok(())
    }
}

fn event(event_num: u64, len: usize) -> ReceivedEvent {
    ReceivedEvent {
        data: vec![0x5A; len],
        event_num,
        data_id: 1,
    }
}

fn quick() -> ReceiveSettings {
    ReceiveSettings {
        recv_timeout: Duration::from_millis(5),
        progress_interval: Duration::from_secs(60),
    }
}

#[test]
fn timeout_then_event() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![Step::Timeout, Step::Event(event(7, 256))]);
    let mut sink = MemorySink::default();
    let mut rx = ReceiveLoop::new(&ctx, &transport, &mut sink, quick());

    assert_eq!(rx.step(), LoopState::Waiting);
    let snap = rx.stats().snapshot();
    assert_eq!((snap.received, snap.written, snap.errors, snap.bytes), (0, 0, 0, 0));

    assert_eq!(rx.step(), LoopState::Dispatching);
    assert_eq!(rx.step(), LoopState::Waiting);
    let snap = rx.stats().snapshot();
    assert_eq!(snap.received, 1);
    assert_eq!(snap.written, 1);
    assert_eq!(snap.bytes, 256);
    assert_eq!(snap.errors, 0);

    ctx.request_stop();
    assert_eq!(rx.step(), LoopState::Draining);
    assert_eq!(rx.step(), LoopState::Stopped);
    assert_eq!(rx.step(), LoopState::Stopped);
    drop(rx);
    assert_eq!(sink.written, vec![7]);
}

#[test]
fn write_errors_are_counted_and_the_loop_goes_on() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![
        Step::Event(event(1, 10)),
        Step::Event(event(2, 10)),
        Step::Event(event(3, 10)),
        Step::Error(TransportError::QueueClosed),
    ]);
    let mut sink = MemorySink {
        fail: vec![2],
        ..Default::default()
    };

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();

    assert_eq!(report.counts.received, 3);
    assert_eq!(report.counts.written, 2);
    assert_eq!(report.counts.errors, 1);
    assert_eq!(report.counts.bytes, 30);
    assert!(!report.succeeded());
    assert_eq!(sink.written, vec![1, 3]);
}

#[test]
fn recoverable_errors_keep_waiting() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![
        Step::Error(TransportError::Registration("control plane busy".into())),
        Step::Event(event(5, 64)),
        Step::Error(TransportError::Unusable("workers stopped".into())),
    ]);
    let mut sink = MemorySink::default();
    let mut rx = ReceiveLoop::new(&ctx, &transport, &mut sink, quick());

    assert_eq!(rx.step(), LoopState::Waiting);
    assert_eq!(rx.step(), LoopState::Dispatching);
    assert_eq!(rx.step(), LoopState::Waiting);
    assert_eq!(rx.step(), LoopState::Draining);
    assert_eq!(rx.step(), LoopState::Stopped);
    assert_eq!(rx.stats().snapshot().written, 1);
}

#[test]
fn stop_flag_ends_the_loop_without_receiving() {
    let ctx = RunContext::new();
    ctx.request_stop();
    let transport = ScriptedReassembler::new(vec![Step::Event(event(1, 1))]);
    let mut sink = MemorySink::default();

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();

    assert_eq!(*transport.calls.lock(), 0);
    assert_eq!(report.counts.received, 0);
    assert!(report.succeeded());
    assert_eq!(report.transport.event_success, 1);
}

#[test]
fn stop_from_another_thread() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![]);
    let mut sink = MemorySink::default();

    let report = std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(30));
            ctx.request_stop();
        });
        ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run()
    });
    assert_eq!(report.counts.received, 0);
    assert!(*transport.calls.lock() >= 1);
}

#[test]
fn final_report_carries_lost_events() {
    let ctx = RunContext::new();
    let lost = vec![
        LostEvent {
            event_num: 11,
            data_id: 1,
            frags: 2,
        },
        LostEvent {
            event_num: 12,
            data_id: 1,
            frags: 1,
        },
    ];
    let transport =
        ScriptedReassembler::new(vec![Step::Error(TransportError::QueueClosed)]).with_lost(lost.clone());
    let mut sink = MemorySink::default();

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();
    assert_eq!(report.lost, lost);
    assert!(report.to_string().contains("<11:1/2> <12:1/1>"));
}

#[test]
fn partials_retired_at_stop_reach_the_report() {
    let ctx = RunContext::new();
    ctx.request_stop();
    let early = LostEvent {
        event_num: 4,
        data_id: 1,
        frags: 3,
    };
    let partial = LostEvent {
        event_num: 9,
        data_id: 1,
        frags: 1,
    };
    let transport = ScriptedReassembler::new(vec![])
        .with_lost(vec![early])
        .with_partial(vec![partial]);
    let mut sink = MemorySink::default();

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();
    assert_eq!(report.lost, vec![early, partial]);
    assert_eq!(*transport.stops.lock(), 1);
    assert!(transport.lost_event().is_none());
}

#[test]
fn progress_snapshots_leave_counters_alone() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![
        Step::Event(event(1, 32)),
        Step::Timeout,
        Step::Event(event(2, 64)),
    ]);
    let mut sink = MemorySink::default();
    let settings = ReceiveSettings {
        recv_timeout: Duration::from_millis(5),
        progress_interval: Duration::ZERO,
    };
    let mut rx = ReceiveLoop::new(&ctx, &transport, &mut sink, settings);

    // Every wait emits a snapshot
    let states: Vec<LoopState> = (0..5).map(|_| rx.step()).collect();
    assert_eq!(
        states,
        vec![
            LoopState::Dispatching,
            LoopState::Waiting,
            LoopState::Waiting,
            LoopState::Dispatching,
            LoopState::Waiting,
        ]
    );
    let snap = rx.stats().snapshot();
    assert_eq!((snap.received, snap.written, snap.errors, snap.bytes), (2, 2, 0, 96));
    assert_eq!(rx.step(), LoopState::Waiting);
    assert_eq!(rx.stats().snapshot(), snap);
    drop(rx);
    assert_eq!(sink.written, vec![1, 2]);
}

#[test]
fn loss_drain_returns_each_entry_once() {
    let transport = ScriptedReassembler::new(vec![]).with_lost(vec![LostEvent {
        event_num: 3,
        data_id: 2,
        frags: 4,
    }]);
    let mut reporter = LossReporter::new();

    let first = reporter.drain(&transport);
    assert_eq!(render_lost(&first), "<3:2/4>");
    assert!(reporter.drain(&transport).is_empty());
    assert_eq!(reporter.reported(), 1);
}

#[test]
fn file_sink_writes_one_file_per_event() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = OutputPattern::new(format!("{}/event_{{:08d}}.dat", dir.path().display()));
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![
        Step::Event(event(1, 128)),
        Step::Event(event(42, 256)),
        Step::Error(TransportError::QueueClosed),
    ]);
    let mut sink = FileSink::new(pattern);

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();

    assert_eq!(report.counts.written, 2);
    let second = std::fs::read(dir.path().join("event_00000042.dat")).unwrap();
    assert_eq!(second.len(), 256);
    assert!(second.iter().all(|b| *b == 0x5A));
    assert_eq!(
        std::fs::metadata(dir.path().join("event_00000001.dat")).unwrap().len(),
        128
    );
}

#[test]
fn file_sink_errors_are_reported_per_event() {
    let ctx = RunContext::new();
    let transport = ScriptedReassembler::new(vec![
        Step::Event(event(1, 8)),
        Step::Error(TransportError::QueueClosed),
    ]);
    let mut sink = FileSink::new(OutputPattern::new("/nonexistent-dir/event_{}.dat"));

    let report = ReceiveLoop::new(&ctx, &transport, &mut sink, quick()).run();
    assert_eq!(report.counts.received, 1);
    assert_eq!(report.counts.errors, 1);
    assert!(!report.succeeded());
}
