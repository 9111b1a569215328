//! ORBFLOW record layer over COBS.
//!
//! Each record is `tag ‖ payload ‖ sum`, where the sum byte makes the whole
//! record add to zero modulo 256. Records are COBS-stuffed on the wire and
//! stamped with the receiver's wall-clock time on arrival.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::cobs::{self, CobsDecoder};

/// Timestamp resolution: nanoseconds since the Unix epoch.
pub const TS_RESOLUTION: u64 = 1_000_000_000;

/// One decoded record.
#[derive(Debug, Clone)]
pub struct OflowFrame {
    /// Routing tag; for trace traffic this is the channel number.
    pub tag: u8,
    pub payload: Bytes,
    /// Checksum byte as received.
    pub sum: u8,
    /// Whether the record summed to zero.
    pub good: bool,
    /// Receive timestamp, nanoseconds since the epoch.
    pub tstamp: u64,
}

/// Streaming ORBFLOW decoder.
#[derive(Debug, Default)]
pub struct OflowDecoder {
    cobs: CobsDecoder,
    perror: u64,
}

impl OflowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records rejected so far: too short, bad checksum, or COBS overrun.
    pub fn error_count(&self) -> u64 {
        self.perror + self.cobs.overruns()
    }

    /// Feed raw wire bytes; every complete record in `input` is delivered to
    /// `on_frame`. All records completed by one call share a receive
    /// timestamp.
    pub fn pump<F: FnMut(&OflowFrame)>(&mut self, input: &[u8], mut on_frame: F) {
        let tstamp = wallclock_ns();
        let perror = &mut self.perror;

        self.cobs.pump(input, |record| {
            if record.len() < 2 {
                *perror += 1;
                return;
            }

            let tag = record[0];
            let sum = record[record.len() - 1];
            let payload = &record[1..record.len() - 1];
            let total = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            let good = total == 0;
            if !good {
                *perror += 1;
            }

            on_frame(&OflowFrame {
                tag,
                payload: Bytes::copy_from_slice(payload),
                sum,
                good,
                tstamp,
            });
        });
    }
}

/// Serialise one record: tag header, checksum trailer, COBS stuffing and the
/// trailing delimiter.
pub fn encode(tag: u8, payload: &[u8], out: &mut Vec<u8>) {
    let sum = payload
        .iter()
        .fold(tag, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg();
    cobs::encode_parts(&[&[tag], payload, &[sum]], out);
}

fn wallclock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() * TS_RESOLUTION + u64::from(d.subsec_nanos()))
        .unwrap_or(0)
}
