//! Backpressure-aware submission of batches to a transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::batch::Batch;
use super::context::RunContext;
use crate::error::GateError;
use crate::Transport::{Rejection, Segmenter, Submission, TransmissionUnit};

// Slice length for permit waits, so a stop request is noticed.
const STOP_POLL: Duration = Duration::from_millis(50);

/// How often and how fast to retry a full send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10_000,
            interval: Duration::from_micros(100),
        }
    }
}

#[derive(Debug)]
struct LimitInner {
    capacity: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

/// Caps the number of batches handed to the transport but not yet released.
#[derive(Debug, Clone)]
pub struct InFlightLimit {
    inner: Arc<LimitInner>,
}

impl InFlightLimit {
    /// `capacity` is clamped to at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LimitInner {
                capacity: capacity.max(1),
                in_use: Mutex::new(0),
                released: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_use.lock()
    }

    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        let mut in_use = self.inner.in_use.lock();
        if *in_use >= self.inner.capacity {
            return None;
        }
        *in_use += 1;
        Some(self.permit())
    }

    /// Block until a permit is free. `None` if `ctx` is asked to stop first.
    pub fn acquire(&self, ctx: &RunContext) -> Option<InFlightPermit> {
        let mut in_use = self.inner.in_use.lock();
        while *in_use >= self.inner.capacity {
            if ctx.should_stop() {
                return None;
            }
            self.inner.released.wait_for(&mut in_use, STOP_POLL);
        }
        *in_use += 1;
        Some(self.permit())
    }

    /// Wait until every permit is back. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.inner.in_use.lock();
        while *in_use > 0 {
            if self
                .inner
                .released
                .wait_until(&mut in_use, deadline)
                .timed_out()
            {
                return *in_use == 0;
            }
        }
        true
    }

    fn permit(&self) -> InFlightPermit {
        InFlightPermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One slot of an [`InFlightLimit`]; given back on drop.
#[derive(Debug)]
pub struct InFlightPermit {
    inner: Arc<LimitInner>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut in_use = self.inner.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.inner.released.notify_all();
    }
}

/// Tags stamped on every unit submitted through a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTag {
    pub data_id: u16,
    pub src_id: u32,
}

/// Shared by all send tasks of a run. Only [`Segmenter::add_to_send_queue`]
/// is called concurrently; no lock is held around it.
pub struct SendGate<'a, S: ?Sized> {
    transport: &'a S,
    ctx: &'a RunContext,
    policy: RetryPolicy,
    limit: InFlightLimit,
    tag: StreamTag,
    accepted: AtomicU64,
}

impl<'a, S: Segmenter + ?Sized> SendGate<'a, S> {
    pub fn new(
        transport: &'a S,
        ctx: &'a RunContext,
        policy: RetryPolicy,
        limit: InFlightLimit,
        tag: StreamTag,
    ) -> Self {
        let policy = RetryPolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        Self {
            transport,
            ctx,
            policy,
            limit,
            tag,
            accepted: AtomicU64::new(0),
        }
    }

    /// Hand `batch` to the transport, retrying while its queue is full.
    ///
    /// On success the transport owns the batch and the assigned buffer id is
    /// returned. On error the batch has already been freed.
    pub fn submit(&self, batch: Batch) -> Result<u64, GateError> {
        if batch.is_empty() {
            return Err(GateError::EmptyBatch);
        }
        let permit = self.limit.acquire(self.ctx).ok_or(GateError::Cancelled)?;
        let buffer_id = self.ctx.next_buffer_id();
        let mut unit = TransmissionUnit::new(batch, buffer_id, self.tag.data_id, self.tag.src_id)
            .with_permit(permit);

        for attempt in 1..=self.policy.max_attempts {
            match self.transport.add_to_send_queue(unit) {
                Submission::Accepted => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(buffer = buffer_id, attempt, "accepted after queue-full retries");
                    }
                    return Ok(buffer_id);
                }
                Submission::Rejected {
                    unit: returned,
                    reason: Rejection::QueueFull,
                } => {
                    unit = returned;
                    if attempt < self.policy.max_attempts {
                        std::thread::sleep(self.policy.interval);
                    }
                }
                Submission::Rejected {
                    unit: returned,
                    reason: Rejection::Failed(source),
                } => {
                    drop(returned);
                    return Err(GateError::Transport { buffer_id, source });
                }
            }
        }

        drop(unit);
        Err(GateError::RetriesExhausted {
            buffer_id,
            attempts: self.policy.max_attempts,
        })
    }

    /// Wait for the transport to release every accepted batch.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.limit.wait_idle(timeout)
    }

    /// Batches the transport accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.limit.in_flight()
    }

    pub fn transport(&self) -> &'a S {
        self.transport
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
