//! ARM TPIU synchronous frame decoder.
//!
//! The TPIU formatter packs several trace streams into 16-byte frames: 15
//! payload bytes plus one auxiliary byte. Even-offset bytes either carry data
//! (bit 0 moved into the auxiliary byte) or announce a stream-ID change (bit 0
//! set, new ID in bits 7:1); the matching auxiliary bit says whether the
//! change applies before or after the following data byte. Odd-offset bytes
//! are always data. A dedicated sync sequence realigns the frame boundary
//! after transport glitches.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Raw frame length on the wire, auxiliary byte included.
pub const FRAME_LEN: usize = 16;

/// The TPIU sync sequence, in wire order.
pub const TPIU_SYNC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];

const SYNC_PATTERN: u32 = 0xFFFF_FF7F;

/// Activity indicator bits, reported alongside the frame counters.
pub const LED_DATA: u8 = 0x01;
pub const LED_TX: u8 = 0x02;
pub const LED_OVERFLOW: u8 = 0x20;
pub const LED_HEARTBEAT: u8 = 0x80;

/// One demultiplexed byte: which stream it belongs to and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpiuEntry {
    pub stream: u8,
    pub data: u8,
}

/// A decoded frame: up to 15 stream-tagged bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpiuFrame {
    pub entries: Vec<TpiuEntry>,
}

/// Outcome of feeding one byte to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpiuEvent {
    /// Byte consumed mid-frame, nothing to report.
    None,
    /// First byte of a new frame accepted.
    Rxing,
    /// Sync sequence recognised while hunting; frame boundary established.
    NewSync,
    /// Sync sequence seen while already aligned.
    Synced,
    /// Byte consumed while hunting for sync.
    Unsynced,
    /// A complete frame was decoded.
    PacketReady(TpiuFrame),
    /// Malformed frame; the decoder has dropped alignment.
    Error,
}

/// Decoder counters, shared with the reporter thread.
#[derive(Debug, Default)]
pub struct TpiuStats {
    pub total_frames: AtomicU64,
    pub lost_frames: AtomicU64,
    pub pending: AtomicU32,
    pub leds: AtomicU8,
}

impl TpiuStats {
    pub fn set_led(&self, bit: u8) {
        self.leds.fetch_or(bit, Ordering::Relaxed);
    }

    /// Take the activity bits accumulated since the last call.
    pub fn take_leds(&self) -> u8 {
        self.leds.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsynced,
    Synced,
    Rxing,
}

/// Byte-at-a-time TPIU de-framer.
pub struct TpiuDecoder {
    state: State,
    buf: [u8; FRAME_LEN],
    fill: usize,
    sync_monitor: u32,
    current_stream: u8,
    stats: Arc<TpiuStats>,
}

impl Default for TpiuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TpiuDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Unsynced,
            buf: [0; FRAME_LEN],
            fill: 0,
            sync_monitor: 0,
            // Stream 0 is never a routable channel, so bytes arriving before
            // the first ID change are dropped downstream.
            current_stream: 0,
            stats: Arc::new(TpiuStats::default()),
        }
    }

    /// Shared handle to the decoder counters.
    pub fn stats(&self) -> Arc<TpiuStats> {
        Arc::clone(&self.stats)
    }

    /// Feed one byte, advancing the frame state machine.
    pub fn pump(&mut self, byte: u8) -> TpiuEvent {
        self.sync_monitor = (self.sync_monitor << 8) | u32::from(byte);

        if self.sync_monitor == SYNC_PATTERN {
            // The first three 0xFF of the sequence were buffered as frame
            // bytes; anything beyond them was a frame we are abandoning.
            let was_unsynced = self.state == State::Unsynced;
            if !was_unsynced && self.fill > 3 {
                self.stats.lost_frames.fetch_add(1, Ordering::Relaxed);
                self.stats.set_led(LED_OVERFLOW);
            }
            self.fill = 0;
            self.stats.pending.store(0, Ordering::Relaxed);
            self.state = State::Synced;
            self.stats.set_led(LED_HEARTBEAT);
            return if was_unsynced {
                TpiuEvent::NewSync
            } else {
                TpiuEvent::Synced
            };
        }

        match self.state {
            State::Unsynced => TpiuEvent::Unsynced,
            State::Synced | State::Rxing => {
                self.buf[self.fill] = byte;
                self.fill += 1;
                self.stats.pending.store(self.fill as u32, Ordering::Relaxed);

                if self.fill < FRAME_LEN {
                    if self.fill == 1 {
                        self.state = State::Rxing;
                        TpiuEvent::Rxing
                    } else {
                        TpiuEvent::None
                    }
                } else {
                    self.fill = 0;
                    self.stats.pending.store(0, Ordering::Relaxed);
                    match self.decode_frame() {
                        Some(frame) => {
                            self.state = State::Synced;
                            self.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            self.stats.set_led(LED_DATA);
                            TpiuEvent::PacketReady(frame)
                        }
                        None => {
                            self.state = State::Unsynced;
                            self.stats.lost_frames.fetch_add(1, Ordering::Relaxed);
                            self.stats.set_led(LED_OVERFLOW);
                            TpiuEvent::Error
                        }
                    }
                }
            }
        }
    }

    /// Decode the 16 buffered bytes. `None` means the frame is malformed
    /// (a stream-ID change referencing the invalid channel 0).
    fn decode_frame(&mut self) -> Option<TpiuFrame> {
        let aux = self.buf[FRAME_LEN - 1];
        let mut entries = Vec::with_capacity(FRAME_LEN - 1);
        let mut delayed_stream = None;

        for k in 0..8 {
            let i = 2 * k;
            let b = self.buf[i];
            let aux_bit = (aux >> k) & 1;

            if b & 1 != 0 {
                let id = b >> 1;
                if id == 0 {
                    return None;
                }
                if aux_bit != 0 {
                    // Change applies after the data byte that follows.
                    delayed_stream = Some(id);
                } else {
                    self.current_stream = id;
                }
            } else {
                entries.push(TpiuEntry {
                    stream: self.current_stream,
                    data: b | aux_bit,
                });
            }

            if i < FRAME_LEN - 2 {
                entries.push(TpiuEntry {
                    stream: self.current_stream,
                    data: self.buf[i + 1],
                });
            }

            if let Some(id) = delayed_stream.take() {
                self.current_stream = id;
            }
        }

        Some(TpiuFrame { entries })
    }
}

/// Build a raw TPIU byte stream from a `(stream, byte)` schedule.
///
/// This is the reference encoder used to exercise the decoder; it mirrors the
/// formatter in the trace hardware. The schedule must pack into a whole
/// number of frames and use stream IDs in 1..=127, otherwise `None` is
/// returned. No sync sequences are emitted; prepend [`TPIU_SYNC`] as needed.
pub fn encode_schedule(schedule: &[(u8, u8)]) -> Option<Vec<u8>> {
    if schedule.iter().any(|&(s, _)| s == 0 || s > 127) {
        return None;
    }

    let mut out = Vec::new();
    let mut current: u8 = 0;
    let mut next = 0usize;

    while next < schedule.len() {
        let mut frame = [0u8; FRAME_LEN];
        let mut aux: u8 = 0;

        for k in 0..8 {
            let i = 2 * k;
            let last_pair = i >= FRAME_LEN - 2;
            let Some(&(stream, data)) = schedule.get(next) else {
                // Ran out of schedule mid-frame; nothing to pad with.
                return None;
            };

            if stream != current {
                // ID change fills the even slot; the datum rides in the odd
                // slot, or waits for the next frame in the final pair.
                frame[i] = (stream << 1) | 1;
                current = stream;
                if !last_pair {
                    frame[i + 1] = data;
                    next += 1;
                }
                continue;
            }

            let after = schedule.get(next + 1);
            if !last_pair {
                if let Some(&(next_stream, _)) = after {
                    if next_stream != current {
                        // Delayed change: the odd byte still belongs to the
                        // old stream, the new ID applies after it.
                        frame[i] = (next_stream << 1) | 1;
                        aux |= 1 << k;
                        frame[i + 1] = data;
                        next += 1;
                        current = next_stream;
                        continue;
                    }
                }
            }

            frame[i] = data & 0xFE;
            aux |= (data & 1) << k;
            next += 1;

            if !last_pair {
                match schedule.get(next) {
                    Some(&(s, d)) if s == current => {
                        frame[i + 1] = d;
                        next += 1;
                    }
                    _ => return None,
                }
            }
        }

        frame[FRAME_LEN - 1] = aux;
        out.extend_from_slice(&frame);
    }

    Some(out)
}
