//! One read→serialize→accumulate→submit pipeline per source, all running
//! concurrently over a shared send gate.

use std::time::Duration;

use tracing::{error, info, warn};

use super::batch::{records_per_batch, BatchAccumulator};
use super::context::RunContext;
use super::gate::SendGate;
use super::record::{PhysicsEvent, PARTICLE_NAMES};
use super::stats::{SourceSnapshot, SourceStats};
use crate::error::PipelineError;
use crate::Source::EventSource;
use crate::Transport::{SendStats, Segmenter};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Records per batch.
    pub batch_records: usize,
    /// Log progress every this many batches.
    pub progress_every: u64,
    /// Log read progress every this many events.
    pub read_progress_every: u64,
    /// How long to wait for the transport to release batches at the end.
    pub drain_wait: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_records: records_per_batch(10),
            progress_every: 10,
            read_progress_every: 500_000,
            drain_wait: Duration::from_secs(5),
        }
    }
}

/// Outcome of one source.
#[derive(Debug)]
pub struct SourceReport {
    pub index: usize,
    pub label: String,
    pub counts: SourceSnapshot,
    pub outcome: Result<(), PipelineError>,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug)]
pub struct DispatchSummary {
    pub sources: Vec<SourceReport>,
    /// `None` in read-only runs.
    pub send_stats: Option<SendStats>,
    pub buffers_submitted: u64,
    /// Every accepted batch was released before the drain wait ran out.
    pub drained: bool,
}

impl DispatchSummary {
    pub fn succeeded(&self) -> usize {
        self.sources.iter().filter(|s| s.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.sources.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

pub struct Dispatcher<'a, S: ?Sized> {
    ctx: &'a RunContext,
    gate: Option<&'a SendGate<'a, S>>,
    settings: DispatchSettings,
}

impl<'a> Dispatcher<'a, dyn Segmenter> {
    /// Read and batch without a transport; batches are counted and dropped.
    pub fn read_only(ctx: &'a RunContext, settings: DispatchSettings) -> Self {
        Self {
            ctx,
            gate: None,
            settings,
        }
    }
}

impl<'a, S: Segmenter + ?Sized> Dispatcher<'a, S> {
    pub fn new(ctx: &'a RunContext, gate: &'a SendGate<'a, S>, settings: DispatchSettings) -> Self {
        Self {
            ctx,
            gate: Some(gate),
            settings,
        }
    }

    /// Run every source to completion. A failing source never stops its siblings.
    pub fn run<Src: EventSource>(&self, sources: Vec<Src>) -> DispatchSummary {
        let labels: Vec<String> = sources.iter().map(|s| s.label().to_string()).collect();
        let stats: Vec<SourceStats> = labels.iter().map(|_| SourceStats::default()).collect();

        let outcomes: Vec<Result<(), PipelineError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = sources
                .into_iter()
                .zip(&stats)
                .enumerate()
                .map(|(index, (mut source, stats))| {
                    std::thread::Builder::new()
                        .name(format!("source-{index}"))
                        .spawn_scoped(scope, move || self.run_source(index, &mut source, stats))
                })
                .collect();

            handles
                .into_iter()
                .map(|spawned| match spawned {
                    Ok(handle) => handle.join().unwrap_or(Err(PipelineError::Panicked)),
                    Err(e) => Err(PipelineError::Spawn(e)),
                })
                .collect()
        });

        let sources: Vec<SourceReport> = outcomes
            .into_iter()
            .zip(labels)
            .zip(&stats)
            .enumerate()
            .map(|(index, ((outcome, label), stats))| {
                if let Err(e) = &outcome {
                    error!(source = index, label = %label, error = %e, "source failed");
                }
                SourceReport {
                    index,
                    label,
                    counts: stats.snapshot(),
                    outcome,
                }
            })
            .collect();

        let (send_stats, drained) = match self.gate {
            Some(gate) => {
                let drained = gate.wait_idle(self.settings.drain_wait);
                if !drained {
                    warn!(
                        in_flight = gate.in_flight(),
                        "batches still in flight after {:?}", self.settings.drain_wait
                    );
                }
                let send_stats = gate.transport().send_stats();
                info!(
                    frames_sent = send_stats.frames_sent,
                    errors = send_stats.errors,
                    buffers = gate.accepted(),
                    "send statistics"
                );
                if send_stats.errors > 0 {
                    warn!(errors = send_stats.errors, "transport reported send errors");
                }
                (Some(send_stats), drained)
            }
            None => (None, true),
        };

        let summary = DispatchSummary {
            sources,
            send_stats,
            buffers_submitted: self.gate.map_or(0, |g| g.accepted()),
            drained,
        };
        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "all sources finished"
        );
        summary
    }

    fn run_source<Src: EventSource>(
        &self,
        index: usize,
        source: &mut Src,
        stats: &SourceStats,
    ) -> Result<(), PipelineError> {
        if self.ctx.should_stop() {
            return Err(PipelineError::Cancelled);
        }
        let total = source.open()?;
        let mut acc = BatchAccumulator::new(index, self.settings.batch_records);
        let read_every = self.settings.read_progress_every.max(1);
        let progress_every = self.settings.progress_every.max(1);
        info!(
            source = index,
            label = source.label(),
            records_per_batch = acc.threshold(),
            "starting source"
        );

        let mut next = source.next_event()?;
        if let Some(first) = &next {
            self.log_sample(index, first);
        }

        while let Some(event) = next {
            acc.append_event(&event);
            let events = stats.record_event();
            if events % read_every == 0 {
                match total {
                    Some(total) => info!(source = index, "read {events}/{total} events"),
                    None => info!(source = index, "read {events} events"),
                }
            }

            next = source.next_event()?;
            if !acc.is_full(next.is_none()) {
                continue;
            }
            if self.ctx.should_stop() {
                return Err(PipelineError::Cancelled);
            }

            let batch = acc.take_and_reset();
            let bytes = batch.len_bytes();
            if let Some(gate) = self.gate {
                gate.submit(batch)?;
            }
            let batches = stats.record_batch(bytes);
            if batches % progress_every == 0 {
                info!(source = index, batches, events, "progress");
            }
        }

        let done = stats.snapshot();
        let _console = self.ctx.console();
        info!(
            source = index,
            label = source.label(),
            events = done.events,
            batches = done.batches,
            "completed {:.2} MB",
            done.megabytes()
        );
        Ok(())
    }

    fn log_sample(&self, index: usize, event: &PhysicsEvent) {
        let _console = self.ctx.console();
        info!(source = index, "first event:");
        for (name, p) in PARTICLE_NAMES.iter().zip(event.particles()) {
            info!(
                source = index,
                "  {name}: E={:.4} px={:.4} py={:.4} pz={:.4}", p.e, p.px, p.py, p.pz
            );
        }
    }
}
