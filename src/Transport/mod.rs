//! Transport seam between the batching pipeline and whatever moves bytes.
//!
//! The send side hands [`TransmissionUnit`]s to a [`Segmenter`]; the receive
//! side pulls reassembled [`ReceivedEvent`]s out of a [`Reassembler`].
//! `shm` provides a loopback implementation over a shared memory frame ring.

pub mod shm;
pub mod uri;

use std::fmt;
use std::time::Duration;

use crate::error::TransportError;
use crate::Stream::batch::Batch;
use crate::Stream::gate::InFlightPermit;

pub use shm::{ReassemblerConfig, SegmenterConfig, ShmReassembler, ShmSegmenter};
pub use uri::DestinationUri;

/// One batch plus the metadata it travels with.
///
/// Dropping the unit is the release: the batch memory is freed and the
/// in-flight permit (if any) goes back to its pool.
#[derive(Debug)]
pub struct TransmissionUnit {
    batch: Batch,
    buffer_id: u64,
    data_id: u16,
    src_id: u32,
    _permit: Option<InFlightPermit>,
}

impl TransmissionUnit {
    pub fn new(batch: Batch, buffer_id: u64, data_id: u16, src_id: u32) -> Self {
        Self {
            batch,
            buffer_id,
            data_id,
            src_id,
            _permit: None,
        }
    }

    /// Attach the permit that is returned when this unit is released.
    pub fn with_permit(mut self, permit: InFlightPermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn payload(&self) -> &[u8] {
        self.batch.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.batch.len_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Process-wide id; also used as the event number on the wire.
    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    pub fn data_id(&self) -> u16 {
        self.data_id
    }

    pub fn src_id(&self) -> u32 {
        self.src_id
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }
}

/// Why a unit came back from [`Segmenter::add_to_send_queue`].
#[derive(Debug)]
pub enum Rejection {
    /// The send queue is at capacity; try again later.
    QueueFull,
    /// Anything else. Not worth retrying.
    Failed(TransportError),
}

/// Outcome of handing a unit to the transport.
///
/// On `Accepted` the transport owns the unit and drops it once transmitted.
/// On `Rejected` ownership comes straight back to the caller.
#[derive(Debug)]
#[must_use]
pub enum Submission {
    Accepted,
    Rejected {
        unit: TransmissionUnit,
        reason: Rejection,
    },
}

/// Aggregate send-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub frames_sent: u64,
    pub errors: u64,
}

/// Aggregate receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub event_success: u64,
    pub reassembly_loss: u64,
    pub enqueue_loss: u64,
    pub data_errors: u64,
    pub control_errors: u64,
}

impl fmt::Display for ReassemblerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={} bytes={} events={} reassembly_loss={} enqueue_loss={} data_errors={} control_errors={}",
            self.total_packets,
            self.total_bytes,
            self.event_success,
            self.reassembly_loss,
            self.enqueue_loss,
            self.data_errors,
            self.control_errors
        )
    }
}

/// An event the transport gave up on after seeing only some of its fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LostEvent {
    pub event_num: u64,
    pub data_id: u16,
    pub frags: u32,
}

impl fmt::Display for LostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}:{}/{}>", self.event_num, self.data_id, self.frags)
    }
}

/// A fully reassembled event. Dropping it releases the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub data: Vec<u8>,
    pub event_num: u64,
    pub data_id: u16,
}

impl ReceivedEvent {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Send half of a transport.
///
/// `add_to_send_queue` must never block; implementations are shared by all
/// send tasks and have to be safe for concurrent callers.
pub trait Segmenter: Send + Sync {
    fn add_to_send_queue(&self, unit: TransmissionUnit) -> Submission;

    fn send_stats(&self) -> SendStats;

    /// Largest payload carried by a single frame.
    fn max_payload_length(&self) -> usize;
}

/// Receive half of a transport.
pub trait Reassembler: Send + Sync {
    /// `Ok(None)` on timeout.
    fn recv_event(&self, timeout: Duration) -> Result<Option<ReceivedEvent>, TransportError>;

    fn stats(&self) -> ReassemblerStats;

    /// Pop the next entry of the lost-event log.
    fn lost_event(&self) -> Option<LostEvent>;

    fn register_worker(&self, hostname: &str) -> Result<(), TransportError>;

    fn deregister_worker(&self) -> Result<(), TransportError>;

    /// Stop internal workers and move every still-partial event to the
    /// lost-event log. Calling it again is a no-op.
    fn stop_threads(&self);
}

impl<T: Segmenter + ?Sized> Segmenter for std::sync::Arc<T> {
    fn add_to_send_queue(&self, unit: TransmissionUnit) -> Submission {
        (**self).add_to_send_queue(unit)
    }

    fn send_stats(&self) -> SendStats {
        (**self).send_stats()
    }

    fn max_payload_length(&self) -> usize {
        (**self).max_payload_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_event_rendering() {
        let lost = LostEvent {
            event_num: 17,
            data_id: 1,
            frags: 3,
        };
        assert_eq!(lost.to_string(), "<17:1/3>");
    }

    #[test]
    fn unit_exposes_batch_bytes() {
        let unit = TransmissionUnit::new(Batch::with_capacity(4, 0), 9, 2, 3);
        assert!(unit.is_empty());
        assert_eq!(unit.len(), 0);
        assert_eq!(unit.buffer_id(), 9);
        assert_eq!(unit.data_id(), 2);
        assert_eq!(unit.src_id(), 3);
    }
}
