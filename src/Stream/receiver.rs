//! Receive loop: pull reassembled events, hand them to a sink, count everything.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::context::RunContext;
use super::sink::EventSink;
use super::stats::{LossReporter, ReceiveReport, ReceiveStats};
use crate::Transport::{Reassembler, ReceivedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Waiting,
    Dispatching,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    /// Bound on each receive call; also the stop-flag latency.
    pub recv_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(1000),
            progress_interval: Duration::from_secs(5),
        }
    }
}

pub struct ReceiveLoop<'a, R: ?Sized, K: ?Sized> {
    ctx: &'a RunContext,
    transport: &'a R,
    sink: &'a mut K,
    settings: ReceiveSettings,
    stats: ReceiveStats,
    loss: LossReporter,
    state: LoopState,
    pending: Option<ReceivedEvent>,
    started: Instant,
    last_progress: Instant,
    report: Option<ReceiveReport>,
}

impl<'a, R, K> ReceiveLoop<'a, R, K>
where
    R: Reassembler + ?Sized,
    K: EventSink + ?Sized,
{
    pub fn new(
        ctx: &'a RunContext,
        transport: &'a R,
        sink: &'a mut K,
        settings: ReceiveSettings,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            transport,
            sink,
            settings,
            stats: ReceiveStats::default(),
            loss: LossReporter::new(),
            state: LoopState::Waiting,
            pending: None,
            started: now,
            last_progress: now,
            report: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    /// Advance by one transition and return the new state.
    pub fn step(&mut self) -> LoopState {
        self.state = match self.state {
            LoopState::Waiting => self.wait(),
            LoopState::Dispatching => self.dispatch(),
            LoopState::Draining => self.drain(),
            LoopState::Stopped => LoopState::Stopped,
        };
        self.state
    }

    /// Step until stopped and return the final report.
    pub fn run(mut self) -> ReceiveReport {
        info!(
            timeout_ms = self.settings.recv_timeout.as_millis() as u64,
            "receiving events"
        );
        while self.step() != LoopState::Stopped {}
        self.report.take().unwrap_or_default()
    }

    fn wait(&mut self) -> LoopState {
        if self.ctx.should_stop() {
            info!("stop requested");
            return LoopState::Draining;
        }

        let next = match self.transport.recv_event(self.settings.recv_timeout) {
            Ok(Some(event)) => {
                self.pending = Some(event);
                LoopState::Dispatching
            }
            Ok(None) => LoopState::Waiting,
            Err(e) if e.is_unrecoverable() => {
                error!(error = %e, "transport failed");
                LoopState::Draining
            }
            Err(e) => {
                warn!(error = %e, "receive error");
                LoopState::Waiting
            }
        };
        self.maybe_progress();
        next
    }

    fn dispatch(&mut self) -> LoopState {
        let Some(event) = self.pending.take() else {
            return LoopState::Waiting;
        };
        self.stats.record_received(event.len());
        match self.sink.write(&event) {
            Ok(()) => self.stats.record_written(),
            Err(e) => {
                self.stats.record_error();
                warn!(event = event.event_num, error = %e, "failed to write event");
            }
        }
        LoopState::Waiting
    }

    fn drain(&mut self) -> LoopState {
        // Stopping retires the partial events; they belong in this report
        self.transport.stop_threads();
        let lost = self.loss.drain(self.transport);
        let report = ReceiveReport {
            counts: self.stats.snapshot(),
            elapsed: self.started.elapsed(),
            transport: self.transport.stats(),
            lost,
        };
        for line in report.to_string().lines() {
            info!("{line}");
        }
        self.report = Some(report);
        LoopState::Stopped
    }

    fn maybe_progress(&mut self) {
        if self.last_progress.elapsed() < self.settings.progress_interval {
            return;
        }
        self.last_progress = Instant::now();
        let snap = self.stats.snapshot();
        let transport = self.transport.stats();
        info!(
            received = snap.received,
            written = snap.written,
            errors = snap.errors,
            bytes = snap.bytes,
            packets = transport.total_packets,
            reassembly_loss = transport.reassembly_loss,
            "progress"
        );
    }
}
