//! De-framers for multiplexed ARM Cortex-M trace streams.
//!
//! Two framings are supported:
//! - ARM TPIU synchronous 16-byte frames, which interleave several trace
//!   streams over one transport and realign on a 4-byte sync sequence.
//! - ORBFLOW records carried over COBS byte stuffing, which are
//!   self-describing (tag + payload + checksum) and delimited by a sync byte.
//!
//! Both decoders are byte pumps: callers feed arbitrary chunks and get
//! complete, channel-tagged output regardless of how the input was split.

pub mod cobs;
pub mod oflow;
pub mod tpiu;

pub use cobs::{find_frame_extent, is_end_of_frame, CobsDecoder, COBS_SYNC};
pub use oflow::{OflowDecoder, OflowFrame};
pub use tpiu::{TpiuDecoder, TpiuEntry, TpiuEvent, TpiuFrame, TpiuStats, TPIU_SYNC};
