//! Stream physics event tables through a transport, or receive events and
//! write them out one file (or queue entry) at a time.
//!
//! Usage:
//!   event-relay --recv -u shm://frames --recv-ip 127.0.0.1 -o 'out/event_{:08d}.dat'
//!   event-relay --send -u shm://frames -t h22 run1.tbl run2.tbl
//!   event-relay -t h22 run1.tbl            (read and batch only)

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use event_relay::config::{
    InputConfig, Mode, OutputTarget, QueueConfig, ReadConfig, ReceiveConfig, SendConfig,
};
use event_relay::logging::init_tracing;
use event_relay::Source::{EventSource, SyntheticSource, TableSource};
use event_relay::Stream::{
    DispatchSummary, Dispatcher, EventSink, FileSink, InFlightLimit, OutputPattern, QueueSink,
    ReceiveLoop, RetryPolicy, RunContext, SendGate, StreamTag,
};
use event_relay::Transport::{DestinationUri, Reassembler, ShmReassembler, ShmSegmenter};

const SYNTHETIC_SEED: u64 = 0x5EED_0001;

#[derive(Parser, Debug)]
#[command(
    name = "event-relay",
    version,
    about = "Send physics event tables over a transport, or receive and persist events"
)]
struct Args {
    /// Tree (table section) to read from each input file
    #[arg(short, long, default_value = "")]
    tree: String,

    /// Send events
    #[arg(short, long)]
    send: bool,

    /// Receive events
    #[arg(short, long)]
    recv: bool,

    /// Transport URI, e.g. shm://frames?slots=4096
    #[arg(short, long, default_value = "")]
    uri: String,

    /// Data id stamped on every buffer
    #[arg(long, default_value_t = 1)]
    dataid: u16,

    /// Event source id stamped on every buffer
    #[arg(long, default_value_t = 1)]
    eventsrcid: u32,

    /// Batch size in MB
    #[arg(long = "bufsize-mb", default_value_t = 10)]
    bufsize_mb: usize,

    /// Frame MTU in bytes (576..=9000)
    #[arg(long, default_value_t = 1500)]
    mtu: usize,

    /// Send rate cap in Gbps; negative disables pacing
    #[arg(long, default_value_t = 1.0, allow_hyphen_values = true)]
    rate: f64,

    /// Register with the control plane
    #[arg(short = 'c', long)]
    withcp: bool,

    /// Skip certificate validation
    #[arg(short = 'v', long)]
    novalidate: bool,

    /// Batches submitted but not yet released, across all inputs
    #[arg(long = "in-flight", default_value_t = 64)]
    in_flight: usize,

    /// Submission attempts per batch while the send queue is full
    #[arg(long, default_value_t = 10_000)]
    retries: u32,

    /// Pause between submission attempts, in microseconds
    #[arg(long = "retry-interval-us", default_value_t = 100)]
    retry_interval_us: u64,

    /// Add a generated input of this many events
    #[arg(long)]
    synthetic: Option<u64>,

    /// Receiver listen address
    #[arg(long = "recv-ip", default_value = "")]
    recv_ip: String,

    /// Receiver starting port
    #[arg(long = "recv-port", default_value_t = 19522)]
    recv_port: u16,

    /// Receiver worker threads
    #[arg(long = "recv-threads", default_value_t = 1)]
    recv_threads: usize,

    /// Per-event output file pattern
    #[arg(short = 'o', long = "output-pattern", default_value = "event_{:08d}.dat")]
    output_pattern: String,

    /// Event reassembly timeout in ms
    #[arg(long = "event-timeout", default_value_t = 500)]
    event_timeout: u64,

    /// Republish received events into this shared memory event queue instead of files
    #[arg(long)]
    queue: Option<String>,

    /// Largest event accepted by the event queue, in bytes
    #[arg(long = "queue-event-size", default_value_t = 2_097_152)]
    queue_event_size: usize,

    /// Input table files
    files: Vec<PathBuf>,
}

impl Args {
    fn input(&self) -> InputConfig {
        InputConfig {
            tree: self.tree.clone(),
            files: self.files.clone(),
            synthetic: self.synthetic,
            batch_mb: self.bufsize_mb,
        }
    }

    fn send_config(&self) -> SendConfig {
        SendConfig {
            input: self.input(),
            uri: self.uri.clone(),
            data_id: self.dataid,
            src_id: self.eventsrcid,
            mtu: self.mtu,
            rate_gbps: self.rate,
            use_control_plane: self.withcp,
            skip_cert_validation: self.novalidate,
            in_flight: self.in_flight,
            retry: RetryPolicy {
                max_attempts: self.retries,
                interval: Duration::from_micros(self.retry_interval_us),
            },
            ..SendConfig::default()
        }
    }

    fn receive_config(&self) -> ReceiveConfig {
        let output = match &self.queue {
            Some(region) => OutputTarget::Queue(QueueConfig {
                region: region.clone(),
                max_event_size: self.queue_event_size,
                ..QueueConfig::default()
            }),
            None => OutputTarget::Files(OutputPattern::new(self.output_pattern.clone())),
        };
        ReceiveConfig {
            uri: self.uri.clone(),
            listen: self.recv_ip.clone(),
            port: self.recv_port,
            threads: self.recv_threads,
            event_timeout_ms: self.event_timeout,
            output,
            ..ReceiveConfig::default()
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when the run finished but something failed along the way.
fn run(args: &Args) -> Result<bool> {
    let ctx = RunContext::new();

    match Mode::from_flags(args.send, args.recv)? {
        Mode::Send => {
            let config = args.send_config();
            config.validate()?;
            ctx.install_interrupt_handler()
                .context("installing interrupt handler")?;
            send(&ctx, &config)
        }
        Mode::Receive => {
            let config = args.receive_config();
            config.validate()?;
            ctx.install_interrupt_handler()
                .context("installing interrupt handler")?;
            receive(&ctx, &config)
        }
        Mode::ReadOnly => {
            let config = ReadConfig {
                input: args.input(),
            };
            config.validate()?;
            ctx.install_interrupt_handler()
                .context("installing interrupt handler")?;
            read_only(&ctx, &config)
        }
    }
}

fn sources(input: &InputConfig) -> Vec<Box<dyn EventSource>> {
    let mut sources: Vec<Box<dyn EventSource>> = input
        .files
        .iter()
        .map(|path| Box::new(TableSource::new(path.clone(), input.tree.clone())) as Box<dyn EventSource>)
        .collect();
    if let Some(count) = input.synthetic {
        sources.push(Box::new(SyntheticSource::new("synthetic", count, SYNTHETIC_SEED)));
    }
    sources
}

fn send(ctx: &RunContext, config: &SendConfig) -> Result<bool> {
    let uri = DestinationUri::parse(&config.uri)?;
    let segmenter = ShmSegmenter::open_and_start(&uri, &config.segmenter_config())
        .with_context(|| format!("starting segmenter for {uri}"))?;
    let gate = SendGate::new(
        &segmenter,
        ctx,
        config.retry,
        InFlightLimit::new(config.in_flight),
        StreamTag {
            data_id: config.data_id,
            src_id: config.src_id,
        },
    );

    let summary = Dispatcher::new(ctx, &gate, config.input.dispatch_settings())
        .run(sources(&config.input));
    print_summary(&summary);
    Ok(summary.all_succeeded())
}

fn read_only(ctx: &RunContext, config: &ReadConfig) -> Result<bool> {
    info!("read-only mode: batches are counted, not sent");
    let summary = Dispatcher::read_only(ctx, config.input.dispatch_settings())
        .run(sources(&config.input));
    print_summary(&summary);
    Ok(summary.all_succeeded())
}

fn print_summary(summary: &DispatchSummary) {
    for source in &summary.sources {
        match &source.outcome {
            Ok(()) => info!(
                source = source.index,
                events = source.counts.events,
                batches = source.counts.batches,
                "{}: ok",
                source.label
            ),
            Err(e) => error!(source = source.index, "{}: {e}", source.label),
        }
    }
    info!(
        "{}/{} inputs succeeded, {} buffers submitted",
        summary.succeeded(),
        summary.sources.len(),
        summary.buffers_submitted
    );
}

fn receive(ctx: &RunContext, config: &ReceiveConfig) -> Result<bool> {
    let uri = DestinationUri::parse(&config.uri)?;
    let reassembler = ShmReassembler::open_and_start(&uri, &config.reassembler_config()?)
        .with_context(|| format!("starting reassembler for {uri}"))?;
    if let Err(e) = reassembler.register_worker(&config.listen) {
        warn!(error = %e, "worker registration failed");
    }

    let mut sink: Box<dyn EventSink> = match &config.output {
        OutputTarget::Files(pattern) => {
            info!(pattern = pattern.as_str(), "writing one file per event");
            Box::new(FileSink::new(pattern.clone()))
        }
        OutputTarget::Queue(queue) => Box::new(
            QueueSink::attach(
                &queue.region,
                queue.max_event_size,
                queue.open_wait,
                queue.slot_wait,
            )
            .with_context(|| format!("attaching to event queue '{}'", queue.region))?,
        ),
    };

    let report =
        ReceiveLoop::new(ctx, &reassembler, &mut sink, config.loop_settings.clone()).run();

    if let Err(e) = reassembler.deregister_worker() {
        warn!(error = %e, "worker deregistration failed");
    }
    Ok(report.succeeded())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_flags_reach_the_send_config() {
        let args = Args::try_parse_from([
            "event-relay",
            "--send",
            "-u",
            "shm://frames",
            "-t",
            "h22",
            "--retries",
            "25",
            "--retry-interval-us",
            "40",
            "run1.tbl",
        ])
        .unwrap();
        let config = args.send_config();
        assert_eq!(config.retry.max_attempts, 25);
        assert_eq!(config.retry.interval, Duration::from_micros(40));
        config.validate().unwrap();
    }

    #[test]
    fn retry_defaults() {
        let args = Args::try_parse_from(["event-relay", "--send"]).unwrap();
        assert_eq!(args.send_config().retry, RetryPolicy::default());
    }
}
