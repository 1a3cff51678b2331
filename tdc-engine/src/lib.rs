#[macro_use]
extern crate num_derive;
extern crate byteorder;

pub mod codec;
pub mod engine;
pub mod errors;
pub mod headers;
pub mod simulation;
pub mod source;
pub mod tdc_tools;

#[cfg(feature = "python")]
mod python;

pub use engine::{Engine, EngineConfig};
pub use errors::Error;

/// Number of hardware input stop channels
pub const TDC_CHANNELS: u8 = 32;
/// Channel number of the start (sync) input
pub const START_CHANNEL: u8 = 0;
/// First marker channel; 100-103 rising edges, 104 timer tick, 105-108 falling edges
pub const MARKER_FIRST: u8 = 100;
pub const MARKER_LAST: u8 = 108;
pub const TIMER_TICK: u8 = 104;
/// Time base of all timestamps in seconds
pub const TIMEBASE: f64 = 1e-12;

/// A single observation of the TDC: arrival time and input channel.
///
/// Channel 0 is the start input, 1..=32 are the stop channels and 100..=108
/// are marker inputs.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Event {
    /// Time in ps from an arbitrary offset
    pub time: i64,
    pub channel: u8,
}

impl Event {
    #[inline]
    pub fn new(time: i64, channel: u8) -> Self {
        Self { time, channel }
    }
}

/// Decoding side of a file format: one fixed size record in, at most one event out.
pub(crate) trait RecordStream {
    fn parse_record(&mut self, record: &[u8]) -> Option<Event>;
}

/// An accumulator fed by the engine's fan-out.
///
/// Every sink declares if it is `pausable`, i.e. if it stops accumulating while
/// the buffers are frozen. Sinks do their own locking; `on_events` is only ever
/// called from the single producer context.
pub trait EventSink: Send + Sync {
    fn pausable(&self) -> bool;
    fn on_events(&self, events: &[Event]);
    fn on_reset(&self);
    /// End of stream: release any state that waits for future events.
    fn on_flush(&self) {}
}
