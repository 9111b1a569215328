use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use bytes::Bytes;
use tracing::{debug, warn};

/// Outbound queue bound per subscriber. A subscriber whose unsent backlog
/// would exceed this is evicted.
pub const SUBSCRIBER_QUEUE_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

#[derive(Debug)]
struct Subscriber {
    peer: SocketAddr,
    tx: Sender<Bytes>,
    queued: Arc<AtomicUsize>,
    dead: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Inner {
    port: u16,
    subscribers: Mutex<Vec<Subscriber>>,
    ending: AtomicBool,
}

/// One channel's fan-out point: a TCP listener plus the current subscriber
/// set. Cheap to clone; all clones share the same listener.
#[derive(Clone, Debug)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Bind the listener and start the accept loop. Port 0 binds an
    /// ephemeral port, reported by [`Registry::port`].
    pub fn start(port: u16) -> Result<Self, RegistryError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|source| RegistryError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| RegistryError::Bind { port, source })?
            .port();

        let inner = Arc::new(Inner {
            port: local_port,
            subscribers: Mutex::new(Vec::new()),
            ending: AtomicBool::new(false),
        });

        let accept_inner = Arc::clone(&inner);
        thread::spawn(move || accept_loop(listener, accept_inner));

        Ok(Self { inner })
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Number of live subscribers (dead ones may still be counted until the
    /// next `send` reaps them).
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Publish `payload` to every healthy subscriber.
    ///
    /// The payload is copied once; subscribers share the copy. Never blocks:
    /// a subscriber without queue room is marked dead and reaped.
    pub fn send(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let bytes = Bytes::copy_from_slice(payload);

        let mut subs = lock(&self.inner.subscribers);
        subs.retain(|s| {
            if s.dead.load(Ordering::Acquire) {
                debug!(peer = %s.peer, "reaping dead subscriber");
                return false;
            }
            true
        });

        for s in subs.iter() {
            if s.queued.load(Ordering::Acquire) + bytes.len() > SUBSCRIBER_QUEUE_BYTES {
                debug!(peer = %s.peer, "evicting slow subscriber");
                s.dead.store(true, Ordering::Release);
                continue;
            }
            s.queued.fetch_add(bytes.len(), Ordering::AcqRel);
            if s.tx.send(bytes.clone()).is_err() {
                s.dead.store(true, Ordering::Release);
            }
        }
    }

    /// Stop accepting, drop all subscribers and unblock the accept loop.
    pub fn shutdown(&self) {
        self.inner.ending.store(true, Ordering::Release);
        lock(&self.inner.subscribers).clear();
        // Nudge the accept loop out of its blocking accept.
        let _ = TcpStream::connect(("127.0.0.1", self.inner.port));
    }
}

fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                if inner.ending.load(Ordering::Acquire) {
                    return;
                }
                warn!(%err, "accept failed");
                continue;
            }
        };
        if inner.ending.load(Ordering::Acquire) {
            return;
        }

        let _ = stream.set_nodelay(true);
        debug!(%peer, port = inner.port, "subscriber connected");

        let (tx, rx) = mpsc::channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let dead = Arc::new(AtomicBool::new(false));

        {
            let queued = Arc::clone(&queued);
            let dead = Arc::clone(&dead);
            thread::spawn(move || writer_loop(stream, rx, queued, dead));
        }

        lock(&inner.subscribers).push(Subscriber {
            peer,
            tx,
            queued,
            dead,
        });
    }
}

/// Drains one subscriber's queue onto its socket. Exits when the sender is
/// dropped (disconnect, eviction or shutdown) or the peer stops reading.
fn writer_loop(
    mut stream: TcpStream,
    rx: Receiver<Bytes>,
    queued: Arc<AtomicUsize>,
    dead: Arc<AtomicBool>,
) {
    while let Ok(chunk) = rx.recv() {
        queued.fetch_sub(chunk.len(), Ordering::AcqRel);
        if dead.load(Ordering::Acquire) {
            break;
        }
        if stream.write_all(&chunk).is_err() {
            dead.store(true, Ordering::Release);
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
