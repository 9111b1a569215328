//! tracemux: demultiplexes ARM Cortex-M trace streams to per-channel TCP
//! ports.
//!
//! The source runs on the main thread and publishes raw blocks into the
//! ring; the processor thread strips the configured framing and fans bytes
//! out to the subscriber registries; an optional reporter thread prints link
//! statistics.

mod distrib;
mod exit;
mod logging;
mod monitor;
mod options;
mod ring;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use tracemux_net::Registry;
use tracemux_source::{
    ByteSource, FileSource, SerialSource, SourceError, TcpSource, UsbSource, RETRY_DELAY,
};

use crate::distrib::{Handler, Processor};
use crate::monitor::Monitor;
use crate::options::{Framing, Options, SourceKind};
use crate::ring::{BlockRing, RawBlock};

/// Grace period for subscriber writers to drain before the process leaves.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

fn main() {
    let cli = match options::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit::SUCCESS,
                _ => exit::OPTION_ERROR,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    logging::init(cli.verbosity);

    let opts = match options::resolve(&cli) {
        Ok(opts) => opts,
        Err(err) => {
            error!("{err}");
            std::process::exit(exit::OPTION_ERROR);
        }
    };

    std::process::exit(run(opts));
}

fn run(opts: Options) -> i32 {
    banner(&opts);
    ignore_sigpipe();

    // Per-channel registries when de-framing, one shared registry otherwise.
    let mut handlers = Vec::new();
    let mut passthrough = None;
    let mut registries = Vec::new();

    match &opts.framing {
        Framing::Tpiu(channels) | Framing::Oflow(channels) => {
            for (index, &channel) in channels.iter().enumerate() {
                let port = opts.listen_port + index as u16;
                let registry = match Registry::start(port) {
                    Ok(registry) => registry,
                    Err(err) => {
                        error!("failed to make network server: {err}");
                        return exit::OPTION_ERROR;
                    }
                };
                warn!("started network interface for channel {channel} on port {port}");
                registries.push(registry.clone());
                handlers.push(Handler::new(channel, registry));
            }
        }
        Framing::None => {
            let registry = match Registry::start(opts.listen_port) {
                Ok(registry) => registry,
                Err(err) => {
                    error!("failed to make network server: {err}");
                    return exit::OPTION_ERROR;
                }
            };
            registries.push(registry.clone());
            passthrough = Some(registry);
        }
    }

    let ring = Arc::new(BlockRing::new());
    let interval_bytes = Arc::new(AtomicU64::new(0));
    let ending = Arc::new(AtomicBool::new(false));

    let processor = Processor::new(
        Arc::clone(&ring),
        opts.framing.clone(),
        handlers,
        passthrough,
        Arc::clone(&interval_bytes),
    );
    let tpiu_stats = processor.tpiu_stats();

    {
        let ending = Arc::clone(&ending);
        let ring = Arc::clone(&ring);
        let registries = registries.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            ending.store(true, Ordering::Release);
            ring.close();
            for registry in &registries {
                registry.shutdown();
            }
            thread::sleep(SHUTDOWN_GRACE);
            std::process::exit(exit::SUCCESS);
        }) {
            error!("failed to establish interrupt handler: {err}");
            return exit::OPTION_ERROR;
        }
    }

    let processor_thread = thread::spawn(move || processor.run());

    if opts.interval_ms > 0 {
        let monitor = Monitor {
            interval_ms: opts.interval_ms,
            interval_bytes: Arc::clone(&interval_bytes),
            max_data_rate: opts.max_data_rate,
            tpiu_stats: matches!(opts.framing, Framing::Tpiu(_)).then_some(tpiu_stats),
            ring: Arc::clone(&ring),
            ending: Arc::clone(&ending),
        };
        thread::spawn(move || monitor.run());
    }

    let mut source: Box<dyn ByteSource> = match &opts.source {
        SourceKind::Usb => match UsbSource::new() {
            Ok(source) => Box::new(source),
            Err(err) => {
                error!("failed to initialise USB interface: {err}");
                return exit::OPTION_ERROR;
            }
        },
        SourceKind::DebugServer { host, port } => Box::new(TcpSource::new(host.clone(), *port)),
        SourceKind::Serial { device, baud } => Box::new(SerialSource::new(device.clone(), *baud)),
        SourceKind::FpgaSerial { device, width } => {
            Box::new(SerialSource::fpga(device.clone(), *width))
        }
        SourceKind::File { path, terminate } => match FileSource::open(path, *terminate) {
            Ok(source) => Box::new(source),
            Err(err) => {
                error!("{err}");
                return exit::FILE_OPEN_ERROR;
            }
        },
    };
    info!("reading from {}", source.describe());

    let code = feed(source.as_mut(), &ring, &ending);

    // Drain: let the processor flush what was published, give subscriber
    // writers a moment, then take the listeners down.
    ending.store(true, Ordering::Release);
    ring.close();
    let _ = processor_thread.join();
    thread::sleep(SHUTDOWN_GRACE);
    for registry in &registries {
        registry.shutdown();
    }
    code
}

/// The source loop: blocking reads published into the ring until shutdown,
/// end of input, or an unrecoverable failure.
fn feed(source: &mut dyn ByteSource, ring: &BlockRing, ending: &AtomicBool) -> i32 {
    let mut block = RawBlock::new();
    let mut last_failure = String::new();

    while !ending.load(Ordering::Acquire) {
        match source.read(&mut block.buf[..]) {
            Ok(0) => continue,
            Ok(n) => {
                block.fill = n;
                ring.produce(&mut block);
                last_failure.clear();
            }
            Err(SourceError::EndOfInput) => return exit::SUCCESS,
            Err(err) if err.is_transient() => {
                // One warning per failure mode, not one per retry.
                let message = err.to_string();
                if message == last_failure {
                    debug!("{message}");
                } else {
                    warn!("{message}");
                    last_failure = message;
                }
                thread::sleep(RETRY_DELAY);
            }
            Err(err) => {
                error!("{err}");
                return match err {
                    SourceError::FileOpen { .. } => exit::FILE_OPEN_ERROR,
                    SourceError::SerialConfig { .. } => exit::SERIAL_SETUP_ERROR,
                    _ => exit::OPTION_ERROR,
                };
            }
        }
    }

    exit::SUCCESS
}

fn banner(opts: &Options) {
    info!("tracemux v{}", env!("CARGO_PKG_VERSION"));
    if opts.interval_ms > 0 {
        info!("report interval: {} ms", opts.interval_ms);
    }
    match &opts.source {
        SourceKind::Usb => info!("source: USB probe table"),
        SourceKind::DebugServer { host, port } => info!("source: debug server {host}:{port}"),
        SourceKind::Serial { device, baud } => info!("source: serial {device} at {baud} baud"),
        SourceKind::FpgaSerial { device, width } => {
            info!("source: fpga traceport on {device}, {width} bit wide");
        }
        SourceKind::File { path, terminate } => info!(
            "source: file {} ({})",
            path.display(),
            if *terminate {
                "terminate on exhaustion"
            } else {
                "ongoing read"
            }
        ),
    }
    if opts.max_data_rate > 0 {
        info!("max data rate: {} bps", opts.max_data_rate);
    }
    match &opts.framing {
        Framing::Tpiu(channels) => info!("use/strip TPIU: true (channels {channels:?})"),
        Framing::Oflow(channels) => info!("use ORBFLOW: true (channels {channels:?})"),
        Framing::None => info!("use/strip TPIU: false"),
    }
}

/// An evaporating subscriber must not kill the process with SIGPIPE; write
/// failures are handled at the socket.
#[cfg(unix)]
fn ignore_sigpipe() {
    // SAFETY: SIG_IGN installs no handler code, so no signal-safety
    // obligations arise.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}
