use std::io::Read;
use std::net::TcpStream;

use tracing::info;

use crate::error::{Result, SourceError};
use crate::ByteSource;

/// Default debug-server port (GDB-server SWO endpoint).
pub const DEFAULT_PORT: u16 = 2332;

/// Pulls trace bytes from a remote debug server over TCP.
///
/// The connection is (re-)established lazily inside `read`; the feeder's
/// retry backoff paces the connect attempts. A lost link is reported as a
/// transient error and the next read reconnects.
pub struct TcpSource {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&mut self) -> Result<()> {
        let addr = self.addr();
        match TcpStream::connect((self.host.as_str(), self.port)) {
            Ok(stream) => {
                info!(%addr, "established debug-server link");
                self.stream = Some(stream);
                Ok(())
            }
            Err(source) => Err(SourceError::Connect { addr, source }),
        }
    }
}

impl ByteSource for TcpSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.stream.is_none() {
            self.connect()?;
        }

        let peer = self.addr();
        let stream = self.stream.as_mut().ok_or(SourceError::LinkLost {
            peer,
        })?;

        match stream.read(buf) {
            Ok(0) | Err(_) => {
                self.stream = None;
                info!(peer = %self.addr(), "lost debug-server link");
                Err(SourceError::LinkLost { peer: self.addr() })
            }
            Ok(n) => Ok(n),
        }
    }

    fn describe(&self) -> String {
        format!("debug server {}", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn connect_failure_is_transient() {
        // Port 1 on localhost is essentially never listening.
        let mut src = TcpSource::new("127.0.0.1", 1);
        let mut buf = [0u8; 16];
        let err = src.read(&mut buf).expect_err("connect should fail");
        assert!(matches!(err, SourceError::Connect { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn reads_bytes_and_reports_lost_link() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("addr should resolve").port();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept should succeed");
            conn.write_all(b"swostream").expect("write should succeed");
            // Dropping the connection ends the link.
        });

        let mut src = TcpSource::new("127.0.0.1", port);
        let mut buf = [0u8; 32];
        let mut got = Vec::new();
        loop {
            match src.read(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(err) => {
                    assert!(matches!(err, SourceError::LinkLost { .. }));
                    assert!(err.is_transient());
                    break;
                }
            }
        }
        assert_eq!(got, b"swostream");
        server.join().expect("server thread should finish");
    }
}
