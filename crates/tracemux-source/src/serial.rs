use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use tracing::info;

use crate::error::{Result, SourceError};
use crate::ByteSource;

/// Link speed of the FPGA-mediated serial interface.
pub const FPGA_LINK_SPEED: u32 = 12_000_000;

/// Effective data rate over the FPGA link: 8 payload bits per 10-bit symbol.
pub const FPGA_DATA_SPEED: u32 = (FPGA_LINK_SPEED / 10) * 8;

/// Reads trace bytes from a serial tty in raw 8N1 mode.
///
/// The port is opened lazily inside `read` so unplug/replug cycles heal
/// themselves; configuration failures are fatal. The FPGA variant runs the
/// link at a fixed 12 Mbaud and selects the trace-port width with a two-byte
/// command before the first read.
pub struct SerialSource {
    device: String,
    baud: u32,
    fpga_width: Option<u8>,
    port: Option<fs::File>,
}

impl SerialSource {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
            fpga_width: None,
            port: None,
        }
    }

    /// FPGA trace-port variant; `width` must be 1, 2 or 4.
    pub fn fpga(device: impl Into<String>, width: u8) -> Self {
        Self {
            device: device.into(),
            baud: FPGA_LINK_SPEED,
            fpga_width: Some(width),
            port: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        let port = fs::OpenOptions::new()
            .read(true)
            .write(self.fpga_width.is_some())
            .open(&self.device)
            .map_err(|source| SourceError::SerialOpen {
                device: self.device.clone(),
                source,
            })?;

        configure_raw(&port, self.baud).map_err(|reason| SourceError::SerialConfig {
            device: self.device.clone(),
            reason,
        })?;

        if let Some(width) = self.fpga_width {
            let mut port = &port;
            port.write_all(&width_command(width))
                .map_err(|err| SourceError::SerialConfig {
                    device: self.device.clone(),
                    reason: format!("cannot select trace width: {err}"),
                })?;
        }

        info!(device = %self.device, baud = self.baud, "serial port opened");
        self.port = Some(port);
        Ok(())
    }
}

impl ByteSource for SerialSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.port.is_none() {
            self.open()?;
        }

        let port = self.port.as_mut().ok_or(SourceError::LinkLost {
            peer: self.device.clone(),
        })?;

        match port.read(buf) {
            Ok(0) | Err(_) => {
                self.port = None;
                Err(SourceError::LinkLost {
                    peer: self.device.clone(),
                })
            }
            Ok(n) => Ok(n),
        }
    }

    fn describe(&self) -> String {
        match self.fpga_width {
            Some(w) => format!("fpga serial {} ({w} bit wide)", self.device),
            None => format!("serial {} at {} baud", self.device, self.baud),
        }
    }
}

/// Width-select command understood by the trace FPGA.
pub fn width_command(width: u8) -> [u8; 2] {
    [b'w', 0xA0 | if width == 4 { 3 } else { width }]
}

/// Program raw 8N1 at `baud`, using `termios2`/`BOTHER` so non-standard
/// rates work.
#[cfg(target_os = "linux")]
fn configure_raw(port: &fs::File, baud: u32) -> std::result::Result<(), String> {
    let fd = port.as_raw_fd();
    let mut tio: libc::termios2 = unsafe { std::mem::zeroed() };

    // SAFETY: fd is an open descriptor owned by `port`, and `tio` is a
    // properly-sized termios2 the kernel fills/reads in place.
    if unsafe { libc::ioctl(fd, libc::TCGETS2, &mut tio) } < 0 {
        return Err(last_errno("TCGETS2"));
    }

    tio.c_iflag &= !(libc::ISTRIP | libc::INLCR | libc::IGNCR | libc::ICRNL | libc::IXON
        | libc::IXOFF);
    tio.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
    tio.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE | libc::CBAUD | libc::CIBAUD);
    tio.c_cflag |= libc::CS8 | libc::CLOCAL | libc::BOTHER;
    tio.c_oflag &= !libc::OPOST;
    tio.c_ispeed = baud;
    tio.c_ospeed = baud;

    // SAFETY: as above; TCSETS2 only reads the struct.
    if unsafe { libc::ioctl(fd, libc::TCSETS2, &tio) } < 0 {
        return Err(format!("unsupported baud rate {baud}"));
    }

    // SAFETY: as above.
    if unsafe { libc::ioctl(fd, libc::TCGETS2, &mut tio) } < 0 {
        return Err(last_errno("TCGETS2"));
    }
    if tio.c_ispeed != baud || tio.c_ospeed != baud {
        return Err(format!("baud rate {baud} not accepted by driver"));
    }

    // SAFETY: TCFLSH takes an integer argument, no pointers involved.
    unsafe { libc::ioctl(fd, libc::TCFLSH, libc::TCIOFLUSH) };
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn configure_raw(port: &fs::File, baud: u32) -> std::result::Result<(), String> {
    let fd = port.as_raw_fd();
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: fd is an open descriptor owned by `port`, and `tio` is a
    // properly-sized termios the libc fills/reads in place.
    if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
        return Err(last_errno("tcgetattr"));
    }

    if unsafe { libc::cfsetspeed(&mut tio, baud as libc::speed_t) } < 0 {
        return Err(format!("unsupported baud rate {baud}"));
    }

    tio.c_iflag &= !(libc::ISTRIP | libc::INLCR | libc::IGNCR | libc::ICRNL | libc::IXON
        | libc::IXOFF);
    tio.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
    tio.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE);
    tio.c_cflag |= libc::CS8 | libc::CLOCAL;
    tio.c_oflag &= !libc::OPOST;

    // SAFETY: as above; tcsetattr only reads the struct.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
        return Err(format!("unsupported baud rate {baud}"));
    }

    // SAFETY: flush pending output on the configured descriptor.
    unsafe { libc::tcflush(fd, libc::TCOFLUSH) };
    Ok(())
}

fn last_errno(what: &str) -> String {
    format!("{what}: {}", std::io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_command_encodes_all_widths() {
        assert_eq!(width_command(1), [b'w', 0xA1]);
        assert_eq!(width_command(2), [b'w', 0xA2]);
        assert_eq!(width_command(4), [b'w', 0xA3]);
    }

    #[test]
    fn missing_device_is_transient() {
        let mut src = SerialSource::new("/dev/nonexistent-tty", 115_200);
        let mut buf = [0u8; 8];
        let err = src.read(&mut buf).expect_err("open should fail");
        assert!(matches!(err, SourceError::SerialOpen { .. }));
        assert!(err.is_transient());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_tty_fails_configuration() {
        let path = std::env::temp_dir().join(format!(
            "tracemux-serial-{}",
            std::process::id()
        ));
        std::fs::write(&path, b"not a tty").expect("temp file should be writable");

        let mut src = SerialSource::new(path.to_string_lossy().into_owned(), 115_200);
        let mut buf = [0u8; 8];
        let err = src.read(&mut buf).expect_err("configure should fail");
        assert!(matches!(err, SourceError::SerialConfig { .. }));
        assert!(!err.is_transient());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn describes_both_variants() {
        let plain = SerialSource::new("/dev/ttyACM0", 921_600);
        assert!(plain.describe().contains("921600"));
        let fpga = SerialSource::fpga("/dev/ttyUSB1", 4);
        assert!(fpga.describe().contains("4 bit"));
    }
}
