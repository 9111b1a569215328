use std::io;
use std::path::PathBuf;

/// Errors raised by a byte source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The input file cannot be opened. Unrecoverable.
    #[error("cannot open file {path}: {source}")]
    FileOpen { path: PathBuf, source: io::Error },

    /// Serial port configuration failed. Unrecoverable: retrying with the
    /// same parameters cannot succeed.
    #[error("serial configuration failed on {device}: {reason}")]
    SerialConfig { device: String, reason: String },

    /// The serial device could not be opened; it may appear later.
    #[error("cannot open serial port {device}: {source}")]
    SerialOpen { device: String, source: io::Error },

    /// The remote debug server is not accepting connections yet.
    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// The transport delivered data and then failed; reopening may recover.
    #[error("link to {peer} lost")]
    LinkLost { peer: String },

    /// No device from the probe table is currently attached.
    #[error("no supported trace probe found")]
    NoProbe,

    /// USB transfer or setup failure.
    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),

    /// Read failure on an open descriptor.
    #[error("read failed: {0}")]
    Read(#[from] io::Error),

    /// The input is exhausted and the source was told to stop at the end.
    #[error("end of input")]
    EndOfInput,
}

impl SourceError {
    /// True when the feeder should back off and call `read` again.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SourceError::FileOpen { .. }
                | SourceError::SerialConfig { .. }
                | SourceError::EndOfInput
        )
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
