//! Error types for every layer of the relay

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or missing configuration, detected before any I/O happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option was not given
    #[error("{option} is required {context}")]
    Missing {
        option: &'static str,
        context: &'static str,
    },

    /// An option was given with an unusable value
    #[error("{option} {reason}")]
    Invalid { option: &'static str, reason: String },

    /// Send and receive were both requested
    #[error("cannot use --send and --recv simultaneously")]
    ConflictingModes,
}

impl ConfigError {
    #[inline]
    pub fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option,
            reason: reason.into(),
        }
    }
}

/// Failures reported by a transport (segmenter or reassembler side).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination URI could not be parsed
    #[error("malformed URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The transport could not reach or set up its data plane
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Control-plane registration failed
    #[error("registration failed: {0}")]
    Registration(String),

    /// The send queue no longer accepts work (transport stopped)
    #[error("send queue is closed")]
    QueueClosed,

    /// A single unit could not be handed to the transport
    #[error("buffer of {len} bytes rejected: {reason}")]
    Rejected { len: usize, reason: String },

    /// The underlying system is gone; nothing more can be sent or received
    #[error("transport unusable: {0}")]
    Unusable(String),
}

impl TransportError {
    /// True when the receive loop has to stop instead of retrying.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unusable(_) | Self::QueueClosed)
    }
}

/// Hard failures of the send gate. Queue-full conditions never surface here
/// unless the retry budget ran out.
#[derive(Debug, Error)]
pub enum GateError {
    /// Batches handed to the gate must carry at least one record
    #[error("refusing to submit an empty batch")]
    EmptyBatch,

    /// The transport reported a full queue on every attempt
    #[error("buffer {buffer_id} not accepted after {attempts} attempts (send queue full)")]
    RetriesExhausted { buffer_id: u64, attempts: u32 },

    /// The transport refused the buffer for a reason other than a full queue
    #[error("buffer {buffer_id} failed: {source}")]
    Transport {
        buffer_id: u64,
        #[source]
        source: TransportError,
    },

    /// The stop flag was raised before the buffer could be submitted
    #[error("submission cancelled by stop request")]
    Cancelled,
}

/// Failures of the event-table reader.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tree '{tree}' not found in {path}")]
    TreeNotFound { tree: String, path: PathBuf },

    #[error("tree '{tree}' has no column '{column}'")]
    MissingColumn { tree: String, column: &'static str },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of one read→serialize→accumulate→submit pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("stopped before the source was exhausted")]
    Cancelled,

    #[error("pipeline task panicked")]
    Panicked,

    #[error("cannot start pipeline task: {0}")]
    Spawn(#[source] io::Error),
}

/// Per-event output failures on the receive side. Counted, never fatal to the loop.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot write {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("event of {len} bytes exceeds the queue event size of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("event queue: {0}")]
    Queue(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_classification() {
        assert!(TransportError::Unusable("gone".into()).is_unrecoverable());
        assert!(TransportError::QueueClosed.is_unrecoverable());
        assert!(!TransportError::Registration("cp down".into()).is_unrecoverable());
        assert!(!TransportError::Rejected {
            len: 10,
            reason: "x".into()
        }
        .is_unrecoverable());
    }

    #[test]
    fn gate_error_messages_name_the_buffer() {
        let err = GateError::RetriesExhausted {
            buffer_id: 42,
            attempts: 10_000,
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("10000"));
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::Missing {
            option: "--uri",
            context: "when --send is enabled",
        };
        assert_eq!(err.to_string(), "--uri is required when --send is enabled");
        let err = ConfigError::invalid("--mtu", "must be between 576 and 9000 bytes");
        assert!(err.to_string().starts_with("--mtu"));
    }
}
