pub mod batch;
pub mod context;
pub mod dispatcher;
pub mod gate;
pub mod pattern;
pub mod receiver;
pub mod record;
pub mod sink;
pub mod stats;

pub use batch::{Batch, BatchAccumulator};
pub use context::RunContext;
pub use dispatcher::{DispatchSettings, DispatchSummary, Dispatcher, SourceReport};
pub use gate::{InFlightLimit, InFlightPermit, RetryPolicy, SendGate, StreamTag};
pub use pattern::OutputPattern;
pub use receiver::{LoopState, ReceiveLoop, ReceiveSettings};
pub use record::{FourVector, PhysicsEvent, RECORD_SIZE};
pub use sink::{EventSink, FileSink, QueueSink};
pub use stats::{LossReporter, ReceiveReport, ReceiveStats, SourceStats};
