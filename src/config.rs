//! Validated run configuration.
//!
//! The binaries parse command lines into these structs; `validate` runs before
//! any file, region or thread is touched.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::Stream::batch::records_per_batch;
use crate::Stream::dispatcher::DispatchSettings;
use crate::Stream::gate::RetryPolicy;
use crate::Stream::pattern::OutputPattern;
use crate::Stream::receiver::ReceiveSettings;
use crate::Transport::{ReassemblerConfig, SegmenterConfig};

pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;
pub const MIN_QUEUE_EVENT_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Send,
    Receive,
    ReadOnly,
}

impl Mode {
    pub fn from_flags(send: bool, recv: bool) -> Result<Self, ConfigError> {
        match (send, recv) {
            (true, true) => Err(ConfigError::ConflictingModes),
            (true, false) => Ok(Mode::Send),
            (false, true) => Ok(Mode::Receive),
            (false, false) => Ok(Mode::ReadOnly),
        }
    }
}

/// Inputs shared by send and read-only runs.
#[derive(Debug, Clone, Default)]
pub struct InputConfig {
    pub tree: String,
    pub files: Vec<PathBuf>,
    /// Extra generated source of this many events.
    pub synthetic: Option<u64>,
    pub batch_mb: usize,
}

impl InputConfig {
    fn validate(&self, context: &'static str) -> Result<(), ConfigError> {
        if self.files.is_empty() && self.synthetic.is_none() {
            return Err(ConfigError::Missing {
                option: "input file(s)",
                context,
            });
        }
        if !self.files.is_empty() && self.tree.trim().is_empty() {
            return Err(ConfigError::Missing {
                option: "--tree",
                context,
            });
        }
        if self.batch_mb == 0 {
            return Err(ConfigError::invalid("--bufsize-mb", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            batch_records: records_per_batch(self.batch_mb),
            ..DispatchSettings::default()
        }
    }
}

/// Read and batch only, no transport.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    pub input: InputConfig,
}

impl ReadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.input.validate("for read-only mode")
    }
}

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub input: InputConfig,
    pub uri: String,
    pub data_id: u16,
    pub src_id: u32,
    pub mtu: usize,
    pub rate_gbps: f64,
    pub use_control_plane: bool,
    pub skip_cert_validation: bool,
    /// Batches submitted but not yet released, across all sources.
    pub in_flight: usize,
    pub retry: RetryPolicy,
    pub send_threads: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            input: InputConfig {
                batch_mb: 10,
                ..InputConfig::default()
            },
            uri: String::new(),
            data_id: 1,
            src_id: 1,
            mtu: 1500,
            rate_gbps: 1.0,
            use_control_plane: false,
            skip_cert_validation: false,
            in_flight: 64,
            retry: RetryPolicy::default(),
            send_threads: 4,
        }
    }
}

impl SendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        const CONTEXT: &str = "when --send is enabled";
        if self.uri.trim().is_empty() {
            return Err(ConfigError::Missing {
                option: "--uri",
                context: CONTEXT,
            });
        }
        self.input.validate(CONTEXT)?;
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::invalid(
                "--mtu",
                format!("must be between {MIN_MTU} and {MAX_MTU} bytes"),
            ));
        }
        if self.rate_gbps == 0.0 || self.rate_gbps.is_nan() {
            return Err(ConfigError::invalid(
                "--rate",
                "must be non-zero (negative disables pacing)",
            ));
        }
        if self.in_flight == 0 {
            return Err(ConfigError::invalid("--in-flight", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("--retries", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            mtu: self.mtu,
            rate_gbps: self.rate_gbps,
            queue_depth: self.in_flight,
            send_threads: self.send_threads,
            use_control_plane: self.use_control_plane,
            skip_cert_validation: self.skip_cert_validation,
        }
    }
}

/// Station (shared memory event queue) the receiver republishes into.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub region: String,
    pub max_event_size: usize,
    pub open_wait: Duration,
    pub slot_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            max_event_size: 2 * 1024 * 1024,
            open_wait: Duration::from_secs(10),
            slot_wait: Duration::from_secs(2),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Missing {
                option: "--queue",
                context: "for queue output",
            });
        }
        if self.max_event_size < MIN_QUEUE_EVENT_SIZE {
            return Err(ConfigError::invalid(
                "--queue-event-size",
                format!("must be at least {MIN_QUEUE_EVENT_SIZE} bytes"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    Files(OutputPattern),
    Queue(QueueConfig),
}

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub uri: String,
    pub listen: String,
    pub port: u16,
    pub threads: usize,
    pub event_timeout_ms: u64,
    pub output: OutputTarget,
    pub loop_settings: ReceiveSettings,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            listen: String::new(),
            port: 19522,
            threads: 1,
            event_timeout_ms: 500,
            output: OutputTarget::Files(OutputPattern::default()),
            loop_settings: ReceiveSettings::default(),
        }
    }
}

impl ReceiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        const CONTEXT: &str = "when --recv is enabled";
        if self.uri.trim().is_empty() {
            return Err(ConfigError::Missing {
                option: "--uri",
                context: CONTEXT,
            });
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Missing {
                option: "--recv-ip",
                context: CONTEXT,
            });
        }
        self.listen_addr()?;
        if self.event_timeout_ms == 0 {
            return Err(ConfigError::invalid("--event-timeout", "must be greater than 0"));
        }
        if self.threads == 0 {
            return Err(ConfigError::invalid("--recv-threads", "must be greater than 0"));
        }
        if let OutputTarget::Queue(queue) = &self.output {
            queue.validate()?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<IpAddr, ConfigError> {
        self.listen
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("--recv-ip", format!("'{}' is not an IP address", self.listen)))
    }

    pub fn reassembler_config(&self) -> Result<ReassemblerConfig, ConfigError> {
        Ok(ReassemblerConfig {
            listen: self.listen_addr()?,
            port: self.port,
            threads: self.threads,
            event_timeout: Duration::from_millis(self.event_timeout_ms),
            ..ReassemblerConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_config() -> SendConfig {
        SendConfig {
            input: InputConfig {
                tree: "h22".into(),
                files: vec!["run1.tbl".into()],
                synthetic: None,
                batch_mb: 10,
            },
            uri: "shm://frames".into(),
            ..SendConfig::default()
        }
    }

    fn recv_config() -> ReceiveConfig {
        ReceiveConfig {
            uri: "shm://frames".into(),
            listen: "127.0.0.1".into(),
            ..ReceiveConfig::default()
        }
    }

    #[test]
    fn modes() {
        assert!(matches!(
            Mode::from_flags(true, true),
            Err(ConfigError::ConflictingModes)
        ));
        assert_eq!(Mode::from_flags(true, false).unwrap(), Mode::Send);
        assert_eq!(Mode::from_flags(false, true).unwrap(), Mode::Receive);
        assert_eq!(Mode::from_flags(false, false).unwrap(), Mode::ReadOnly);
    }

    #[test]
    fn send_defaults_validate() {
        send_config().validate().unwrap();
        let d = SendConfig::default();
        assert_eq!((d.data_id, d.src_id, d.mtu, d.in_flight), (1, 1, 1500, 64));
        assert_eq!(d.input.batch_mb, 10);
    }

    #[test]
    fn send_rejections() {
        let mut c = send_config();
        c.uri.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Missing { option: "--uri", .. })));

        let mut c = send_config();
        c.input.tree.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Missing { option: "--tree", .. })));

        let mut c = send_config();
        c.input.files.clear();
        assert!(c.validate().is_err());
        c.input.synthetic = Some(100);
        c.validate().unwrap();

        for mtu in [575, 9001] {
            let mut c = send_config();
            c.mtu = mtu;
            assert!(matches!(c.validate(), Err(ConfigError::Invalid { option: "--mtu", .. })));
        }

        let mut c = send_config();
        c.input.batch_mb = 0;
        assert!(c.validate().is_err());

        let mut c = send_config();
        c.rate_gbps = 0.0;
        assert!(c.validate().is_err());
        c.rate_gbps = -1.0;
        c.validate().unwrap();

        let mut c = send_config();
        c.retry.max_attempts = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { option: "--retries", .. })));
    }

    #[test]
    fn receive_rejections() {
        recv_config().validate().unwrap();

        let mut c = recv_config();
        c.listen = "not-an-ip".into();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { option: "--recv-ip", .. })));

        let mut c = recv_config();
        c.listen.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Missing { option: "--recv-ip", .. })));

        let mut c = recv_config();
        c.event_timeout_ms = 0;
        assert!(c.validate().is_err());

        let mut c = recv_config();
        c.output = OutputTarget::Queue(QueueConfig {
            region: "station".into(),
            max_event_size: 512,
            ..QueueConfig::default()
        });
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid { option: "--queue-event-size", .. })
        ));
    }

    #[test]
    fn reassembler_settings_follow_config() {
        let mut c = recv_config();
        c.threads = 3;
        c.event_timeout_ms = 250;
        let r = c.reassembler_config().unwrap();
        assert_eq!(r.threads, 3);
        assert_eq!(r.event_timeout, Duration::from_millis(250));
        assert_eq!(r.port, 19522);
    }

    #[test]
    fn read_only_needs_inputs() {
        let read = ReadConfig {
            input: InputConfig {
                batch_mb: 10,
                ..InputConfig::default()
            },
        };
        assert!(read.validate().is_err());
        let settings = InputConfig {
            tree: "h22".into(),
            files: vec!["a.tbl".into()],
            synthetic: None,
            batch_mb: 1,
        }
        .dispatch_settings();
        assert_eq!(settings.batch_records, 8192);
    }
}
