//! Raw-byte sources feeding the trace pipeline.
//!
//! One source is active per process: a USB trace probe, a TCP debug server,
//! a serial tty (plain or FPGA-mediated), or a regular file. All of them
//! present the same blocking-read contract; open, reconnect and device-scan
//! behaviour lives inside each implementation so the feeder loop stays
//! source-agnostic.

use std::time::Duration;

pub mod error;
pub mod file;
pub mod serial;
pub mod tcp;
pub mod usb;

pub use error::{Result, SourceError};
pub use file::FileSource;
pub use serial::SerialSource;
pub use tcp::TcpSource;
pub use usb::UsbSource;

/// Backoff between retries after a transient failure.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Poll interval for a file source waiting for the file to grow.
pub const FILE_POLL_DELAY: Duration = Duration::from_millis(100);

/// A blocking producer of raw trace bytes.
///
/// `read` fills `buf` and returns the byte count. `Ok(0)` means "no data this
/// cycle" (a USB bulk timeout, or a file poll) and is not end of input; the
/// caller just reads again. Errors are classified by
/// [`SourceError::is_transient`]: transient ones are retried after
/// [`RETRY_DELAY`], the rest terminate the process.
pub trait ByteSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Human-readable description for startup and diagnostic logs.
    fn describe(&self) -> String;
}
