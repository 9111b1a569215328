//! Distribution processor: drains the ring, strips framing and fans the
//! per-channel byte streams out to their subscriber registries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use tracemux_frame::tpiu::LED_TX;
use tracemux_frame::{OflowDecoder, TpiuDecoder, TpiuEvent};
use tracemux_net::Registry;

use crate::options::Framing;
use crate::ring::{BlockRing, RawBlock, TRANSFER_SIZE};

/// One channel's output leg: staging buffer plus its registry.
///
/// The staging buffer accumulates the channel's bytes while one input block
/// is decoded and is flushed at block end, so subscribers see one TCP write
/// per (block, channel) rather than per byte.
pub struct Handler {
    channel: u8,
    staging: Vec<u8>,
    registry: Registry,
}

impl Handler {
    pub fn new(channel: u8, registry: Registry) -> Self {
        Self {
            channel,
            staging: Vec::with_capacity(TRANSFER_SIZE),
            registry,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        // A record landing near the staging bound flushes early rather than
        // growing the buffer; staging capacity must bound memory, not split
        // records.
        if self.staging.len() + bytes.len() > TRANSFER_SIZE {
            self.flush();
        }
        assert!(
            bytes.len() <= TRANSFER_SIZE,
            "staging buffer cannot hold a {} byte record",
            bytes.len()
        );
        self.staging.extend_from_slice(bytes);
    }

    fn push(&mut self, byte: u8) {
        if self.staging.len() == TRANSFER_SIZE {
            self.flush();
        }
        self.staging.push(byte);
    }

    fn flush(&mut self) {
        if !self.staging.is_empty() {
            self.registry.send(&self.staging);
            self.staging.clear();
        }
    }
}

/// Consumer half of the pipeline. Owns the decoders and the handler list;
/// runs on its own thread until the ring closes.
pub struct Processor {
    ring: Arc<BlockRing>,
    framing: Framing,
    tpiu: TpiuDecoder,
    oflow: OflowDecoder,
    handlers: Vec<Handler>,
    /// Registry used when no framing is configured.
    passthrough: Option<Registry>,
    interval_bytes: Arc<AtomicU64>,
}

impl Processor {
    pub fn new(
        ring: Arc<BlockRing>,
        framing: Framing,
        handlers: Vec<Handler>,
        passthrough: Option<Registry>,
        interval_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            ring,
            framing,
            tpiu: TpiuDecoder::new(),
            oflow: OflowDecoder::new(),
            handlers,
            passthrough,
            interval_bytes,
        }
    }

    /// Shared TPIU decoder counters, for the interval reporter.
    pub fn tpiu_stats(&self) -> Arc<tracemux_frame::TpiuStats> {
        self.tpiu.stats()
    }

    /// Process blocks until the ring closes, then flush and return.
    pub fn run(mut self) {
        let mut block = RawBlock::new();
        while self.ring.consume(&mut block) {
            if block.fill == 0 {
                continue;
            }
            self.interval_bytes
                .fetch_add(block.fill as u64, Ordering::Relaxed);

            match self.framing {
                Framing::Tpiu(_) => self.strip_tpiu(&block),
                Framing::Oflow(_) => self.strip_oflow(&block),
                Framing::None => {
                    if let Some(registry) = &self.passthrough {
                        registry.send(block.payload());
                    }
                }
            }

            self.purge();
            block.fill = 0;
        }
        self.purge();
    }

    /// Pump one block through the TPIU decoder, routing each demultiplexed
    /// byte to its channel handler.
    fn strip_tpiu(&mut self, block: &RawBlock) {
        let handlers = &mut self.handlers;
        let stats = self.tpiu.stats();
        // Cache the last channel looked up; trace bytes arrive in runs.
        let mut cached: Option<(u8, Option<usize>)> = None;

        for &byte in block.payload() {
            match self.tpiu.pump(byte) {
                TpiuEvent::PacketReady(frame) => {
                    for entry in &frame.entries {
                        let slot = match cached {
                            Some((ch, slot)) if ch == entry.stream => slot,
                            _ => {
                                let slot =
                                    handlers.iter().position(|h| h.channel == entry.stream);
                                cached = Some((entry.stream, slot));
                                slot
                            }
                        };
                        if let Some(i) = slot {
                            handlers[i].push(entry.data);
                            stats.set_led(LED_TX);
                        }
                    }
                }
                TpiuEvent::Error => {
                    warn!("malformed TPIU frame, hunting for sync");
                }
                _ => {}
            }
        }
    }

    /// Pump one block through the COBS/ORBFLOW decoder, routing each good
    /// record's payload by tag.
    fn strip_oflow(&mut self, block: &RawBlock) {
        let handlers = &mut self.handlers;
        let mut cached: Option<(u8, Option<usize>)> = None;

        self.oflow.pump(block.payload(), |frame| {
            if !frame.good {
                return;
            }
            let slot = match cached {
                Some((ch, slot)) if ch == frame.tag => slot,
                _ => {
                    let slot = handlers.iter().position(|h| h.channel == frame.tag);
                    cached = Some((frame.tag, slot));
                    slot
                }
            };
            if let Some(i) = slot {
                handlers[i].append(&frame.payload);
            }
        });
    }

    /// Flush every non-empty staging buffer to its registry.
    fn purge(&mut self) {
        for handler in &mut self.handlers {
            handler.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    use tracemux_frame::tpiu::{encode_schedule, TPIU_SYNC};
    use tracemux_frame::oflow;

    use super::*;

    fn subscriber(registry: &Registry) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", registry.port()))
            .expect("subscriber should connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout should apply");
        let start = Instant::now();
        while registry.subscriber_count() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "subscriber not seen");
            thread::sleep(Duration::from_millis(10));
        }
        stream
    }

    fn feed(ring: &BlockRing, bytes: &[u8]) {
        let mut block = RawBlock::new();
        for chunk in bytes.chunks(TRANSFER_SIZE) {
            block.buf[..chunk.len()].copy_from_slice(chunk);
            block.fill = chunk.len();
            ring.produce(&mut block);
        }
    }

    fn read_exact_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).expect("read should succeed");
        buf
    }

    fn spawn_processor(
        framing: Framing,
        handlers: Vec<Handler>,
        passthrough: Option<Registry>,
    ) -> (Arc<BlockRing>, Arc<AtomicU64>, thread::JoinHandle<()>) {
        let ring = Arc::new(BlockRing::new());
        let interval_bytes = Arc::new(AtomicU64::new(0));
        let processor = Processor::new(
            Arc::clone(&ring),
            framing,
            handlers,
            passthrough,
            Arc::clone(&interval_bytes),
        );
        let join = thread::spawn(move || processor.run());
        (ring, interval_bytes, join)
    }

    #[test]
    fn tpiu_routes_channels_in_isolation() {
        let reg1 = Registry::start(0).expect("registry should start");
        let reg2 = Registry::start(0).expect("registry should start");
        let mut sub1 = subscriber(&reg1);
        let mut sub2 = subscriber(&reg2);

        let handlers = vec![Handler::new(1, reg1.clone()), Handler::new(2, reg2.clone())];
        let (ring, interval_bytes, join) =
            spawn_processor(Framing::Tpiu(vec![1, 2]), handlers, None);

        // Channel 1 and 2 interleaved, plus channel 9 which nobody serves.
        let schedule: Vec<(u8, u8)> = vec![
            (1, 0x10),
            (1, 0x11),
            (2, 0x20),
            (2, 0x21),
            (9, 0x90),
            (1, 0x12),
            (1, 0x13),
            (1, 0x14),
            (1, 0x15),
            (1, 0x16),
            (1, 0x17),
        ];
        let raw = encode_schedule(&schedule).expect("schedule should pack");
        let mut wire = TPIU_SYNC.to_vec();
        wire.extend_from_slice(&raw);
        feed(&ring, &wire);
        ring.close();
        join.join().expect("processor should finish");

        assert_eq!(
            read_exact_bytes(&mut sub1, 8),
            vec![0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]
        );
        assert_eq!(read_exact_bytes(&mut sub2, 2), vec![0x20, 0x21]);
        assert_eq!(interval_bytes.load(Ordering::Relaxed), wire.len() as u64);
    }

    #[test]
    fn oflow_routes_by_tag_and_drops_bad_frames() {
        let reg = Registry::start(0).expect("registry should start");
        let mut sub = subscriber(&reg);

        let handlers = vec![Handler::new(7, reg.clone())];
        let (ring, _bytes, join) = spawn_processor(Framing::Oflow(vec![7]), handlers, None);

        let mut wire = Vec::new();
        oflow::encode(7, b"ABC", &mut wire);
        oflow::encode(5, b"other channel", &mut wire);
        let mut corrupt = Vec::new();
        oflow::encode(7, b"zzz", &mut corrupt);
        corrupt[2] ^= 0x40;
        wire.extend_from_slice(&corrupt);
        oflow::encode(7, b"DEF", &mut wire);

        feed(&ring, &wire);
        ring.close();
        join.join().expect("processor should finish");

        assert_eq!(read_exact_bytes(&mut sub, 6), b"ABCDEF");
    }

    #[test]
    fn passthrough_forwards_blocks_unchanged() {
        let reg = Registry::start(0).expect("registry should start");
        let mut sub = subscriber(&reg);

        let (ring, interval_bytes, join) =
            spawn_processor(Framing::None, Vec::new(), Some(reg.clone()));

        feed(&ring, b"raw swo bytes, untouched");
        ring.close();
        join.join().expect("processor should finish");

        assert_eq!(read_exact_bytes(&mut sub, 24), b"raw swo bytes, untouched");
        assert_eq!(interval_bytes.load(Ordering::Relaxed), 24);
    }

    #[test]
    fn oflow_record_split_across_blocks_is_reassembled() {
        let reg = Registry::start(0).expect("registry should start");
        let mut sub = subscriber(&reg);

        let handlers = vec![Handler::new(3, reg.clone())];
        let (ring, _bytes, join) = spawn_processor(Framing::Oflow(vec![3]), handlers, None);

        let mut wire = Vec::new();
        oflow::encode(3, b"split across two blocks", &mut wire);
        let cut = wire.len() / 2;

        let mut block = RawBlock::new();
        block.buf[..cut].copy_from_slice(&wire[..cut]);
        block.fill = cut;
        ring.produce(&mut block);
        block.buf[..wire.len() - cut].copy_from_slice(&wire[cut..]);
        block.fill = wire.len() - cut;
        ring.produce(&mut block);

        ring.close();
        join.join().expect("processor should finish");

        assert_eq!(read_exact_bytes(&mut sub, 23), b"split across two blocks");
    }
}
