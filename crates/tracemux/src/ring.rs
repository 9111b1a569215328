//! Bounded ring of raw transfer blocks between the source and the processor.
//!
//! Single producer (the source thread), single consumer (the processor
//! thread). Blocks move in and out by swapping buffers, so neither side
//! copies payload bytes and neither side holds the lock across I/O. When the
//! ring is full the oldest unprocessed block is dropped and counted: trace
//! capture is realtime, and backpressure must never reach the probe.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Size of one transfer block.
pub const TRANSFER_SIZE: usize = 8192;

/// Number of ring slots.
pub const NUM_RAW_BLOCKS: usize = 10;

/// A transfer block: fixed-capacity buffer plus fill level.
pub struct RawBlock {
    pub buf: Box<[u8; TRANSFER_SIZE]>,
    pub fill: usize,
}

impl RawBlock {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; TRANSFER_SIZE]),
            fill: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.fill]
    }
}

impl Default for RawBlock {
    fn default() -> Self {
        Self::new()
    }
}

struct State {
    slots: Vec<RawBlock>,
    wp: usize,
    rp: usize,
    dropped: u64,
    closed: bool,
}

/// The producer/consumer ring. One slot is kept free so `wp == rp` always
/// means empty.
pub struct BlockRing {
    state: Mutex<State>,
    data_ready: Condvar,
}

impl BlockRing {
    pub fn new() -> Self {
        Self::with_slots(NUM_RAW_BLOCKS)
    }

    pub fn with_slots(slots: usize) -> Self {
        debug_assert!(slots >= 4);
        Self {
            state: Mutex::new(State {
                slots: (0..slots).map(|_| RawBlock::new()).collect(),
                wp: 0,
                rp: 0,
                dropped: 0,
                closed: false,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Publish a filled block. The caller's block is swapped with a recycled
    /// one and reset, ready for the next read. Never blocks: a full ring
    /// drops its oldest unprocessed block instead.
    pub fn produce(&self, block: &mut RawBlock) {
        {
            let mut s = self.lock();
            let n = s.slots.len();
            if (s.wp + 1) % n == s.rp {
                s.rp = (s.rp + 1) % n;
                s.dropped += 1;
            }
            let wp = s.wp;
            std::mem::swap(&mut s.slots[wp], block);
            s.wp = (wp + 1) % n;
        }
        self.data_ready.notify_one();
        block.fill = 0;
    }

    /// Take the next block in production order, swapping in the caller's
    /// spent block. Blocks until data arrives; returns `false` once the ring
    /// is closed and drained.
    pub fn consume(&self, block: &mut RawBlock) -> bool {
        let mut s = self.lock();
        loop {
            if s.wp != s.rp {
                let rp = s.rp;
                std::mem::swap(&mut s.slots[rp], block);
                s.rp = (rp + 1) % s.slots.len();
                return true;
            }
            if s.closed {
                return false;
            }
            s = match self.data_ready.wait(s) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Wake the consumer and make it drain whatever is left, then stop.
    pub fn close(&self) {
        self.lock().closed = true;
        self.data_ready.notify_all();
    }

    /// Blocks discarded by the drop-oldest policy.
    pub fn dropped_blocks(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BlockRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn block_with(tag: u8, len: usize) -> RawBlock {
        let mut b = RawBlock::new();
        b.buf[..len].fill(tag);
        b.fill = len;
        b
    }

    fn produce_tagged(ring: &BlockRing, tag: u8) {
        let mut b = block_with(tag, 4);
        ring.produce(&mut b);
        assert_eq!(b.fill, 0, "produce should hand back a reset block");
    }

    #[test]
    fn blocks_arrive_in_production_order() {
        let ring = BlockRing::with_slots(4);
        produce_tagged(&ring, 1);
        produce_tagged(&ring, 2);
        produce_tagged(&ring, 3);
        ring.close();

        let mut block = RawBlock::new();
        let mut seen = Vec::new();
        while ring.consume(&mut block) {
            seen.push(block.buf[0]);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(ring.dropped_blocks(), 0);
    }

    #[test]
    fn full_ring_drops_oldest_and_counts() {
        // 4 slots hold 3 published blocks; two more overwrite the two oldest.
        let ring = BlockRing::with_slots(4);
        for tag in 1..=5 {
            produce_tagged(&ring, tag);
        }
        ring.close();

        let mut block = RawBlock::new();
        let mut seen = Vec::new();
        while ring.consume(&mut block) {
            seen.push(block.buf[0]);
        }
        assert_eq!(seen, vec![3, 4, 5]);
        assert_eq!(ring.dropped_blocks(), 2);
    }

    #[test]
    fn consumer_wakes_on_produce() {
        let ring = Arc::new(BlockRing::with_slots(4));
        let consumer_ring = Arc::clone(&ring);

        let consumer = thread::spawn(move || {
            let mut block = RawBlock::new();
            assert!(consumer_ring.consume(&mut block));
            block.payload().to_vec()
        });

        // Give the consumer a moment to block on the condvar.
        thread::sleep(std::time::Duration::from_millis(50));
        let mut b = block_with(9, 3);
        ring.produce(&mut b);

        let got = consumer.join().expect("consumer thread should finish");
        assert_eq!(got, vec![9, 9, 9]);
    }

    #[test]
    fn close_unblocks_waiting_consumer() {
        let ring = Arc::new(BlockRing::with_slots(4));
        let consumer_ring = Arc::clone(&ring);

        let consumer = thread::spawn(move || {
            let mut block = RawBlock::new();
            consumer_ring.consume(&mut block)
        });

        thread::sleep(std::time::Duration::from_millis(50));
        ring.close();
        assert!(!consumer.join().expect("consumer thread should finish"));
    }

    #[test]
    fn streams_many_blocks_across_threads() {
        let ring = Arc::new(BlockRing::new());
        let consumer_ring = Arc::clone(&ring);

        let consumer = thread::spawn(move || {
            let mut block = RawBlock::new();
            let mut total = 0usize;
            let mut last = 0u64;
            while consumer_ring.consume(&mut block) {
                // Payload carries a monotonically increasing sequence number.
                let seq = u64::from_le_bytes(
                    block.payload()[..8].try_into().expect("payload should hold a u64"),
                );
                assert!(seq > last || last == 0, "sequence must not reorder");
                last = seq;
                total += 1;
            }
            total
        });

        let mut block = RawBlock::new();
        for seq in 1..=1000u64 {
            block.buf[..8].copy_from_slice(&seq.to_le_bytes());
            block.fill = 8;
            ring.produce(&mut block);
        }
        ring.close();

        let consumed = consumer.join().expect("consumer thread should finish");
        let dropped = ring.dropped_blocks() as usize;
        assert_eq!(consumed + dropped, 1000);
    }
}
