//! Run statistics and the lost-event reporter

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::Transport::{LostEvent, Reassembler, ReassemblerStats};

/// Megabits per second for `bytes` moved in `elapsed`. Zero for an empty interval.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / 1e6 / secs
}

/// Counters of one send task. Written by that task only, readable from anywhere.
#[derive(Debug, Default)]
pub struct SourceStats {
    events: AtomicU64,
    batches: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub events: u64,
    pub batches: u64,
    pub bytes: u64,
}

impl SourceStats {
    pub fn record_event(&self) -> u64 {
        self.events.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_batch(&self, bytes: usize) -> u64 {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            events: self.events.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl SourceSnapshot {
    pub fn megabytes(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Receive-side counters, shared between the loop and progress readers.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    received: AtomicU64,
    written: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveSnapshot {
    pub received: u64,
    pub written: u64,
    pub errors: u64,
    pub bytes: u64,
}

impl ReceiveStats {
    pub fn record_received(&self, len: usize) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiveSnapshot {
        ReceiveSnapshot {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Drains a transport's lost-event log.
///
/// The transport hands out each entry once, so a second drain with no new
/// losses in between comes back empty.
#[derive(Debug, Default)]
pub struct LossReporter {
    reported: u64,
}

impl LossReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll until the transport has nothing more.
    pub fn drain<R: Reassembler + ?Sized>(&mut self, transport: &R) -> Vec<LostEvent> {
        let lost: Vec<LostEvent> = std::iter::from_fn(|| transport.lost_event()).collect();
        self.reported += lost.len() as u64;
        lost
    }

    /// Entries returned by all drains so far.
    pub fn reported(&self) -> u64 {
        self.reported
    }
}

/// Space-separated `<event:data/frags>` list.
pub fn render_lost(lost: &[LostEvent]) -> String {
    lost.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything printed when the receive loop finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveReport {
    pub counts: ReceiveSnapshot,
    pub elapsed: Duration,
    pub transport: ReassemblerStats,
    pub lost: Vec<LostEvent>,
}

impl ReceiveReport {
    /// A run succeeds when no event failed to be written.
    pub fn succeeded(&self) -> bool {
        self.counts.errors == 0
    }

    pub fn megabytes(&self) -> f64 {
        self.counts.bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn mbps(&self) -> f64 {
        throughput_mbps(self.counts.bytes, self.elapsed)
    }
}

impl fmt::Display for ReceiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Receive statistics:")?;
        writeln!(f, "  Events received: {}", self.counts.received)?;
        writeln!(f, "  Events written:  {}", self.counts.written)?;
        writeln!(f, "  Write errors:    {}", self.counts.errors)?;
        writeln!(f, "  Data received:   {:.2} MB", self.megabytes())?;
        writeln!(f, "  Duration:        {} ms", self.elapsed.as_millis())?;
        if self.counts.received > 0 {
            writeln!(f, "  Average rate:    {:.2} Mbps", self.mbps())?;
        }
        writeln!(f, "  Transport:       {}", self.transport)?;
        if self.lost.is_empty() {
            write!(f, "  Lost events:     none")
        } else {
            write!(
                f,
                "  Lost events ({}): {}",
                self.lost.len(),
                render_lost(&self.lost)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbps_of_one_megabyte_per_second() {
        let mbps = throughput_mbps(1_000_000, Duration::from_secs(1));
        assert!((mbps - 8.0).abs() < 1e-9);
        assert_eq!(throughput_mbps(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn source_counters() {
        let stats = SourceStats::default();
        assert_eq!(stats.record_event(), 1);
        assert_eq!(stats.record_event(), 2);
        assert_eq!(stats.record_batch(256), 1);
        assert_eq!(
            stats.snapshot(),
            SourceSnapshot {
                events: 2,
                batches: 1,
                bytes: 256
            }
        );
    }

    #[test]
    fn report_rendering() {
        let report = ReceiveReport {
            counts: ReceiveSnapshot {
                received: 2,
                written: 1,
                errors: 1,
                bytes: 512,
            },
            elapsed: Duration::from_millis(1500),
            transport: ReassemblerStats::default(),
            lost: vec![
                LostEvent {
                    event_num: 4,
                    data_id: 1,
                    frags: 2,
                },
                LostEvent {
                    event_num: 9,
                    data_id: 1,
                    frags: 1,
                },
            ],
        };
        assert!(!report.succeeded());
        let text = report.to_string();
        assert!(text.contains("Write errors:    1"));
        assert!(text.contains("1500 ms"));
        assert!(text.contains("<4:1/2> <9:1/1>"));
        assert!(text.contains("Mbps"));
    }

    #[test]
    fn no_rate_without_events() {
        let report = ReceiveReport::default();
        assert!(report.succeeded());
        assert!(!report.to_string().contains("Mbps"));
    }
}
