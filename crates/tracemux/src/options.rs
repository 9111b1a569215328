use std::path::PathBuf;

use clap::Parser;

use tracemux_source::serial::FPGA_DATA_SPEED;
use tracemux_source::tcp::DEFAULT_PORT as DEBUG_SERVER_PORT;

/// Default base port for subscriber listeners.
pub const DEFAULT_LISTEN_PORT: u16 = 3443;

const DEFAULT_DEBUG_SERVER_HOST: &str = "localhost";

#[derive(Parser, Debug)]
#[command(
    name = "tracemux",
    version,
    about = "Demultiplexes ARM Cortex-M trace streams to per-channel TCP ports"
)]
pub struct Cli {
    /// Serial speed in baud (also sets the reported max data rate).
    #[arg(short = 'a', value_name = "BAUD")]
    pub serial_speed: Option<u32>,

    /// When reading from a file, terminate at end of file.
    #[arg(short = 'e')]
    pub eof_terminate: bool,

    /// Take input from the specified file.
    #[arg(short = 'f', value_name = "FILENAME")]
    pub input_file: Option<PathBuf>,

    /// Base listen port for subscriber connections.
    #[arg(short = 'l', value_name = "PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Output link statistics every <INTERVAL> ms (0 disables).
    #[arg(short = 'm', value_name = "INTERVAL", default_value_t = 0)]
    pub interval_ms: u64,

    /// Use the traceport FPGA interface with 1, 2 or 4 bit width
    /// (implies TPIU).
    #[arg(short = 'o', value_name = "WIDTH")]
    pub orbtrace_width: Option<u8>,

    /// Serial port to use.
    #[arg(short = 'p', value_name = "PORT")]
    pub serial_port: Option<String>,

    /// Debug server to connect to, as <host>[:<port>].
    #[arg(short = 's', value_name = "SERVER")]
    pub server: Option<String>,

    /// Use TPIU framing with this comma-separated channel list, stripping
    /// the framing from the output flows.
    #[arg(short = 't', value_name = "CHANNELS", value_delimiter = ',')]
    pub tpiu_channels: Option<Vec<u8>>,

    /// Use ORBFLOW/COBS framing with this comma-separated channel list.
    #[arg(short = 'c', value_name = "CHANNELS", value_delimiter = ',')]
    pub oflow_channels: Option<Vec<u8>>,

    /// Verbosity, 0 (errors) to 3 (debug).
    #[arg(short = 'v', value_name = "LEVEL", default_value_t = 2)]
    pub verbosity: u8,
}

/// Which de-framing the processor applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Pass raw blocks through to one listener.
    None,
    /// Strip TPIU frames, serving each listed channel on its own port.
    Tpiu(Vec<u8>),
    /// Strip COBS/ORBFLOW records, routing by tag.
    Oflow(Vec<u8>),
}

/// Where the raw bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Usb,
    DebugServer { host: String, port: u16 },
    Serial { device: String, baud: u32 },
    FpgaSerial { device: String, width: u8 },
    File { path: PathBuf, terminate: bool },
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub source: SourceKind,
    pub framing: Framing,
    pub listen_port: u16,
    pub interval_ms: u64,
    /// Expected peak data rate in bits/sec; 0 if unknown.
    pub max_data_rate: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("cannot specify file and port or server at the same time")]
    FileConflictsWithLink,
    #[error("cannot specify port and server at the same time")]
    PortConflictsWithServer,
    #[error("cannot use TPIU and ORBFLOW framing together")]
    FramingConflict,
    #[error("channel number {0} out of range (1..127)")]
    ChannelOutOfRange(u8),
    #[error("channel {0} listed twice")]
    DuplicateChannel(u8),
    #[error("empty channel list")]
    EmptyChannelList,
    #[error("illegal traceport width {0} (must be 1, 2 or 4)")]
    BadWidth(u8),
    #[error("a serial port must be specified for the traceport interface")]
    WidthNeedsSerialPort,
    #[error("a channel list (-t) is required with the traceport interface")]
    WidthNeedsChannels,
    #[error("server port in {0} is not a number")]
    BadServerPort(String),
}

pub fn resolve(cli: &Cli) -> Result<Options, OptionsError> {
    if cli.input_file.is_some() && (cli.serial_port.is_some() || cli.server.is_some()) {
        return Err(OptionsError::FileConflictsWithLink);
    }
    if cli.serial_port.is_some() && cli.server.is_some() {
        return Err(OptionsError::PortConflictsWithServer);
    }

    let framing = match (&cli.tpiu_channels, &cli.oflow_channels, cli.orbtrace_width) {
        (Some(_), Some(_), _) => return Err(OptionsError::FramingConflict),
        (None, Some(chs), _) => Framing::Oflow(validate_channels(chs)?),
        (Some(chs), None, _) => Framing::Tpiu(validate_channels(chs)?),
        (None, None, Some(_)) => return Err(OptionsError::WidthNeedsChannels),
        (None, None, None) => Framing::None,
    };

    let source = if let Some(width) = cli.orbtrace_width {
        if !matches!(width, 1 | 2 | 4) {
            return Err(OptionsError::BadWidth(width));
        }
        if !matches!(framing, Framing::Tpiu(_)) {
            return Err(OptionsError::WidthNeedsChannels);
        }
        let Some(device) = cli.serial_port.clone() else {
            return Err(OptionsError::WidthNeedsSerialPort);
        };
        SourceKind::FpgaSerial { device, width }
    } else if let Some(path) = &cli.input_file {
        SourceKind::File {
            path: path.clone(),
            terminate: cli.eof_terminate,
        }
    } else if let Some(device) = &cli.serial_port {
        SourceKind::Serial {
            device: device.clone(),
            baud: cli.serial_speed.unwrap_or(115_200),
        }
    } else if let Some(server) = &cli.server {
        let (host, port) = parse_server(server)?;
        SourceKind::DebugServer { host, port }
    } else {
        SourceKind::Usb
    };

    let max_data_rate = match &source {
        SourceKind::FpgaSerial { .. } => FPGA_DATA_SPEED,
        _ => cli.serial_speed.unwrap_or(0),
    };

    Ok(Options {
        source,
        framing,
        listen_port: cli.listen_port,
        interval_ms: cli.interval_ms,
        max_data_rate,
    })
}

fn validate_channels(channels: &[u8]) -> Result<Vec<u8>, OptionsError> {
    if channels.is_empty() {
        return Err(OptionsError::EmptyChannelList);
    }
    let mut seen = [false; 128];
    for &ch in channels {
        if ch == 0 || ch > 127 {
            return Err(OptionsError::ChannelOutOfRange(ch));
        }
        if seen[ch as usize] {
            return Err(OptionsError::DuplicateChannel(ch));
        }
        seen[ch as usize] = true;
    }
    Ok(channels.to_vec())
}

fn parse_server(server: &str) -> Result<(String, u16), OptionsError> {
    match server.split_once(':') {
        Some((host, port)) => {
            let host = if host.is_empty() {
                DEFAULT_DEBUG_SERVER_HOST
            } else {
                host
            };
            let port = port
                .parse()
                .map_err(|_| OptionsError::BadServerPort(server.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => {
            let host = if server.is_empty() {
                DEFAULT_DEBUG_SERVER_HOST
            } else {
                server
            };
            Ok((host.to_string(), DEBUG_SERVER_PORT))
        }
    }
}
