use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{check_range, Error};
use crate::{Event, EventSink, TDC_CHANNELS};

pub const MAX_BIN_WIDTH: i32 = 1_000_000;
pub const MIN_BIN_COUNT: usize = 2;
pub const MAX_BIN_COUNT: usize = 1_000_000;

/// Parameters shared by all start stop histograms
///
/// # Parameters
///    - bin_width: width of one bin in ps
///    - bin_count: number of bins; larger differences go to the overflow counter
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistParams {
    pub bin_width: i32,
    pub bin_count: usize,
}

impl Default for HistParams {
    fn default() -> Self {
        Self {
            bin_width: 100,
            bin_count: 1_000,
        }
    }
}

/// Copy of one start stop histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub bin_width: i32,
    pub bins: Vec<u32>,
    /// Time differences of `bin_width * bin_count` and above
    pub overflow: u32,
    /// Sum over all bins
    pub counts: u64,
    /// Events seen on the start channel
    pub starts: u32,
    /// Events seen on the stop channel
    pub stops: u32,
}

impl HistogramSnapshot {
    /// Lower edge of every bin in ps.
    pub fn bin_edges(&self) -> Vec<i64> {
        (0..self.bins.len())
            .map(|i| i as i64 * self.bin_width as i64)
            .collect()
    }
}

struct PairHistogram {
    bins: Vec<u32>,
    overflow: u32,
    starts: u32,
    stops: u32,
    armed: Option<i64>,
    stopped: bool,
}

impl PairHistogram {
    fn new(bin_count: usize) -> Self {
        Self {
            bins: vec![0; bin_count],
            overflow: 0,
            starts: 0,
            stops: 0,
            armed: None,
            stopped: false,
        }
    }

    fn clear(&mut self) {
        for bin in self.bins.iter_mut() {
            *bin = 0;
        }
        self.overflow = 0;
        self.starts = 0;
        self.stops = 0;
    }

    fn snapshot(&self, bin_width: i32) -> HistogramSnapshot {
        HistogramSnapshot {
            bin_width,
            bins: self.bins.clone(),
            overflow: self.overflow,
            counts: self.bins.iter().map(|&b| b as u64).sum(),
            starts: self.starts,
            stops: self.stops,
        }
    }
}

struct HistState {
    enabled: bool,
    single_stop: bool,
    params: HistParams,
    pairs: BTreeMap<(u8, u8), PairHistogram>,
}

impl HistState {
    fn clear_all(&mut self) {
        let bin_count = self.params.bin_count;
        for pair in self.pairs.values_mut() {
            *pair = PairHistogram::new(bin_count);
        }
    }
}

/// Start stop histograms between configured channel pairs.
///
/// A start event arms its pairs. In multistop mode every following stop up to
/// the next start is binned at `(stop - start) / bin_width`; in single stop mode
/// only the first one. When start and stop channel coincide, each event first
/// acts as the stop of the previous one and then arms the pair again.
pub struct HistogramEngine {
    state: Mutex<HistState>,
}

fn check_channel(channel: u8) -> Result<u8, Error> {
    check_range("histogram channel", channel, 0, TDC_CHANNELS)
}

impl HistogramEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HistState {
                enabled: false,
                single_stop: false,
                params: HistParams::default(),
                pairs: BTreeMap::new(),
            }),
        }
    }

    pub fn enable(&self, enable: bool) {
        self.state.lock().enabled = enable;
        info!("start stop histograms {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Sets bin width and count of all histograms, clearing them.
    pub fn set_params(&self, bin_width: i32, bin_count: usize) -> Result<(), Error> {
        check_range("histogram bin width", bin_width, 1, MAX_BIN_WIDTH)?;
        check_range("histogram bin count", bin_count, MIN_BIN_COUNT, MAX_BIN_COUNT)?;
        let mut state = self.state.lock();
        state.params = HistParams {
            bin_width,
            bin_count,
        };
        state.clear_all();
        info!("histogram bin width {} ps, {} bins", bin_width, bin_count);
        Ok(())
    }

    pub fn params(&self) -> HistParams {
        self.state.lock().params
    }

    /// Selects single stop (`true`) or multistop mode. A mode change clears all histograms.
    pub fn preselect_single_stop(&self, single: bool) {
        let mut state = self.state.lock();
        if state.single_stop != single {
            state.single_stop = single;
            state.clear_all();
            info!("{} histograms", if single { "single stop" } else { "multistop" });
        }
    }

    pub fn single_stop(&self) -> bool {
        self.state.lock().single_stop
    }

    /// Adds the histogram of `stop` events after `start` events, or clears it if present.
    pub fn add_histogram(&self, start: u8, stop: u8) -> Result<(), Error> {
        check_channel(start)?;
        check_channel(stop)?;
        let mut state = self.state.lock();
        let bin_count = state.params.bin_count;
        state
            .pairs
            .insert((start, stop), PairHistogram::new(bin_count));
        debug!("histogram {} -> {} added", start, stop);
        Ok(())
    }

    pub fn remove_histogram(&self, start: u8, stop: u8) -> Result<(), Error> {
        check_channel(start)?;
        check_channel(stop)?;
        if self.state.lock().pairs.remove(&(start, stop)).is_some() {
            debug!("histogram {} -> {} removed", start, stop);
        }
        Ok(())
    }

    /// Configured `(start, stop)` pairs.
    pub fn histograms(&self) -> Vec<(u8, u8)> {
        self.state.lock().pairs.keys().copied().collect()
    }

    pub fn read(&self, start: u8, stop: u8, reset: bool) -> Result<HistogramSnapshot, Error> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(Error::NotEnabled(String::from("Start stop histogram")));
        }
        let bin_width = state.params.bin_width;
        let pair = state.pairs.get_mut(&(start, stop)).ok_or_else(|| {
            Error::InvalidParameter(format!("no histogram {} -> {}", start, stop))
        })?;
        let snapshot = pair.snapshot(bin_width);
        if reset {
            pair.clear();
        }
        Ok(snapshot)
    }
}

impl Default for HistogramEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for HistogramEngine {
    fn pausable(&self) -> bool {
        true
    }

    fn on_events(&self, events: &[Event]) {
        let mut state = self.state.lock();
        if !state.enabled || state.pairs.is_empty() {
            return;
        }
        let single_stop = state.single_stop;
        let bin_width = state.params.bin_width as i64;

        for event in events {
            for (&(start, stop), pair) in state.pairs.iter_mut() {
                if event.channel == stop {
                    pair.stops = pair.stops.wrapping_add(1);
                    if let Some(armed) = pair.armed {
                        let diff = event.time - armed;
                        if diff >= 0 && !(single_stop && pair.stopped) {
                            let idx = (diff / bin_width) as usize;
                            match pair.bins.get_mut(idx) {
                                Some(bin) => *bin = bin.wrapping_add(1),
                                None => pair.overflow = pair.overflow.wrapping_add(1),
                            }
                            pair.stopped = true;
                        }
                    }
                }
                if event.channel == start {
                    pair.starts = pair.starts.wrapping_add(1);
                    pair.armed = Some(event.time);
                    pair.stopped = false;
                }
            }
        }
    }

    fn on_reset(&self) {
        self.state.lock().clear_all();
    }
}
