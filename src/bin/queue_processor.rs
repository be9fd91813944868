//! Downstream consumer of the shared memory event queue: prints the
//! four-vectors of every record it receives.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use event_relay::logging::init_tracing;
use event_relay::Stream::record::{records, PARTICLE_NAMES, RECORD_SIZE};
use event_relay::Stream::RunContext;
use event_relay::MPMC::{ChannelBuilder, Consumer};

#[derive(Parser, Debug)]
#[command(name = "queue-processor", version, about = "Consume events from a shared memory event queue")]
struct Args {
    /// Event queue (shared memory region) name
    #[arg(long, default_value = "relay_events")]
    queue: String,

    /// Create the queue when it does not exist yet
    #[arg(long)]
    create: bool,

    /// Slots of a newly created queue (power of two)
    #[arg(long, default_value_t = 64)]
    slots: usize,

    /// Largest event of a newly created queue, in bytes
    #[arg(long = "event-size", default_value_t = 2_097_152)]
    event_size: usize,

    /// Seconds to wait for the queue to appear
    #[arg(long = "open-wait", default_value_t = 10)]
    open_wait: u64,

    /// Only count events instead of printing every record
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Default)]
struct Totals {
    events: u64,
    records: u64,
    skipped: u64,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let ctx = RunContext::new();
    ctx.install_interrupt_handler()
        .context("installing interrupt handler")?;

    let consumer = ChannelBuilder::new()
        .with_region(args.queue.clone())
        .with_capacity(args.slots)
        .with_slot_payload(args.event_size)
        .create_if_missing(args.create)
        .with_open_wait(Duration::from_secs(args.open_wait))
        .build_consumer()
        .with_context(|| format!("opening event queue '{}'", args.queue))?;
    info!(
        queue = consumer.region(),
        max_event_size = consumer.max_message_size(),
        "processing events"
    );

    let mut totals = Totals::default();
    let outcome = consume(&ctx, &consumer, args.quiet, &mut totals);

    info!(
        events = totals.events,
        records = totals.records,
        skipped = totals.skipped,
        "shutdown complete"
    );
    outcome
}

fn consume(ctx: &RunContext, consumer: &Consumer, quiet: bool, totals: &mut Totals) -> Result<()> {
    while !ctx.should_stop() {
        match consumer.receive_timeout_with_meta(Duration::from_secs(1)) {
            Ok(Some((meta, payload))) => {
                totals.events += 1;
                if payload.len() < RECORD_SIZE {
                    totals.skipped += 1;
                    warn!(
                        event = meta.event_num,
                        "received {} bytes, expected at least {RECORD_SIZE}",
                        payload.len()
                    );
                    continue;
                }
                for event in records(&payload) {
                    totals.records += 1;
                    if quiet {
                        continue;
                    }
                    for (name, p) in PARTICLE_NAMES.iter().zip(event.particles()) {
                        info!(
                            event = meta.event_num,
                            "{name} four-vector: E={}, Px={}, Py={}, Pz={}",
                            p.e,
                            p.px,
                            p.py,
                            p.pz
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!("event queue shut down");
                return Ok(());
            }
            Err(e) => return Err(e).context("reading from event queue"),
        }
    }
    info!("stop requested");
    Ok(())
}
