//! TCP fan-out for demultiplexed trace bytes.
//!
//! Each [`Registry`] owns one listener and any number of subscribers. A
//! subscriber gets every byte published after it connected, in publish
//! order, as a plain byte stream with no added framing. Slow subscribers are
//! evicted rather than throttled: publishing never blocks, so backpressure
//! can never reach the trace source.

mod registry;

pub use registry::{Registry, RegistryError, SUBSCRIBER_QUEUE_BYTES};
