use std::collections::{HashMap, VecDeque};

use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{check_range, Error};
use crate::tdc_tools::circular_buffer::CircularBuffer;
use crate::{Event, EventSink, TDC_CHANNELS};

/// Signal events remembered per channel
const MAX_BUFFER_SIZE: usize = 4096;
/// Idler events waiting for their window to pass
const MAX_PENDING_IDLERS: usize = 4096;

pub const MAX_HG2_BIN_WIDTH: i32 = 1_000_000;
pub const MIN_HG2_BIN_COUNT: usize = 16;
pub const MAX_HG2_BIN_COUNT: usize = 65_536;

/// Histogram parameters of the heralded g2 correlations
///
/// # Parameters
///    - bin_width: width of one bin in ps
///    - bin_count: number of bins, centered on zero delay
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Hg2Params {
    pub bin_width: i32,
    pub bin_count: usize,
}

impl Default for Hg2Params {
    fn default() -> Self {
        Self {
            bin_width: 1,
            bin_count: 256,
        }
    }
}

impl Hg2Params {
    /// Index of the zero delay bin
    pub fn central_bin(&self) -> usize {
        self.bin_count / 2
    }

    /// Delays `lower <= t_signal - t_idler < upper` covered by the bins,
    /// from the lower edge of bin 0 to the upper edge of the last bin.
    pub fn delay_range(&self) -> (i64, i64) {
        let width = self.bin_width as i64;
        let central = self.central_bin() as i64;
        let below = (2 * central + 1) * width;
        let above = (2 * (self.bin_count as i64 - central) - 1) * width;
        // ceil of the half edges, the bins are centered on multiples of the width
        ((1 - below).div_euclid(2), (above + 1).div_euclid(2))
    }

    /// Delay in ps at the center of every bin.
    pub fn delays(&self) -> Vec<i64> {
        let central = self.central_bin() as i64;
        (0..self.bin_count as i64)
            .map(|k| (k - central) * self.bin_width as i64)
            .collect()
    }

    #[inline]
    fn bin(&self, delta: i64) -> Option<usize> {
        let width = self.bin_width as i64;
        let idx = self.central_bin() as i64 + (2 * delta + width).div_euclid(2 * width);
        if idx >= 0 && (idx as usize) < self.bin_count {
            Some(idx as usize)
        } else {
            None
        }
    }
}

/// Channels of the heralded g2 correlations
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Hg2Input {
    pub idler: u8,
    pub signal1: u8,
    pub signal2: u8,
}

impl Default for Hg2Input {
    fn default() -> Self {
        Self {
            idler: 1,
            signal1: 2,
            signal2: 3,
        }
    }
}

/// Raw counts behind the g2 function.
#[derive(Debug, Clone, PartialEq)]
pub struct Hg2Raw {
    /// Idler events analysed
    pub idler_events: i64,
    /// Idler events finalized before their window had passed, the pending queue was full
    pub early_idlers: u64,
    /// Idler events with a signal 1 event closer than half a bin width
    pub coinc_events: i64,
    pub hist_signal1_idler: Vec<i64>,
    pub hist_signal2_idler: Vec<i64>,
}

struct Hg2State {
    enabled: bool,
    params: Hg2Params,
    input: Hg2Input,
    pending: VecDeque<i64>,
    signal1: CircularBuffer<i64>,
    signal2: CircularBuffer<i64>,
    hist1: Vec<i64>,
    hist2: Vec<i64>,
    // sparse, bin_count^2 gets too large to keep dense
    tcp: HashMap<(u32, u32), i64>,
    idler_events: i64,
    coinc_events: i64,
    early_idlers: u64,
}

impl Hg2State {
    fn new(params: Hg2Params, input: Hg2Input) -> Self {
        Self {
            enabled: false,
            params,
            input,
            pending: VecDeque::new(),
            signal1: CircularBuffer::new(MAX_BUFFER_SIZE),
            signal2: CircularBuffer::new(MAX_BUFFER_SIZE),
            hist1: vec![0; params.bin_count],
            hist2: vec![0; params.bin_count],
            tcp: HashMap::new(),
            idler_events: 0,
            coinc_events: 0,
            early_idlers: 0,
        }
    }

    fn clear(&mut self) {
        let enabled = self.enabled;
        *self = Hg2State::new(self.params, self.input);
        self.enabled = enabled;
    }

    fn signal_bins(&self, buffer: &CircularBuffer<i64>, idler: i64) -> Vec<(i64, usize)> {
        let (lower, upper) = self.params.delay_range();
        buffer
            .iter()
            .skip_while(|&&t| t - idler >= upper)
            .take_while(|&&t| t - idler >= lower)
            .filter_map(|&t| {
                let delta = t - idler;
                self.params.bin(delta).map(|idx| (delta, idx))
            })
            .collect()
    }

    fn finalize_idler(&mut self, idler: i64) {
        let s1 = self.signal_bins(&self.signal1, idler);
        let s2 = self.signal_bins(&self.signal2, idler);

        for &(_, a) in &s1 {
            self.hist1[a] += 1;
        }
        for &(_, b) in &s2 {
            self.hist2[b] += 1;
        }
        for &(_, a) in &s1 {
            for &(_, b) in &s2 {
                *self.tcp.entry((a as u32, b as u32)).or_insert(0) += 1;
            }
        }

        self.idler_events += 1;
        let width = self.params.bin_width as i64;
        if s1.iter().any(|&(delta, _)| 2 * delta.abs() < width) {
            self.coinc_events += 1;
        }
    }

    /// Finalizes every idler whose window closed before `time`.
    fn finalize_until(&mut self, time: i64) {
        let (_, upper) = self.params.delay_range();
        while let Some(&idler) = self.pending.front() {
            if idler + upper > time {
                break;
            }
            self.pending.pop_front();
            self.finalize_idler(idler);
        }
    }

    fn push(&mut self, event: &Event) {
        self.finalize_until(event.time);

        if event.channel == self.input.idler {
            if self.pending.len() >= MAX_PENDING_IDLERS {
                if let Some(oldest) = self.pending.pop_front() {
                    if self.early_idlers == 0 {
                        warn!("too many idler events pending, finalizing before their window closed");
                    }
                    self.early_idlers += 1;
                    self.finalize_idler(oldest);
                }
            }
            self.pending.push_back(event.time);
        } else if event.channel == self.input.signal1 {
            self.signal1.push(event.time);
        } else if event.channel == self.input.signal2 {
            self.signal2.push(event.time);
        }
    }

    fn tcp_matrix(&self) -> Array2<i64> {
        let n = self.params.bin_count;
        let mut tcp = Array2::<i64>::zeros((n, n));
        for (&(a, b), &count) in &self.tcp {
            tcp[[a as usize, b as usize]] = count;
        }
        tcp
    }

    fn tcp_flat(&self) -> Vec<i64> {
        let n = self.params.bin_count;
        let mut tcp = vec![0; n * n];
        for (&(a, b), &count) in &self.tcp {
            tcp[a as usize + b as usize * n] = count;
        }
        tcp
    }
}

/// Building blocks of heralded second order correlation functions.
///
/// Every idler event is held back until the stream has passed the upper edge
/// of the last bin. Then every signal 1 and signal 2 event whose delay falls
/// into one of the bins, centered on zero delay, is counted, and every
/// (signal 1, signal 2) pair around the same idler counts as a triple
/// coincidence in the 2D map `tcp[bin1][bin2]`.
///
/// Signal events are kept in circular buffers of the last 4096 events per
/// channel, which bounds the rate at which the correlation range is complete.
/// At most 4096 idlers wait at once; beyond that the oldest is finalized early
/// and counted in `early_idlers`.
pub struct Hg2Engine {
    state: Mutex<Hg2State>,
}

impl Hg2Engine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Hg2State::new(Hg2Params::default(), Hg2Input::default())),
        }
    }

    /// Enables or disables the calculations, clearing the correlations either way.
    pub fn enable(&self, enable: bool) {
        let mut state = self.state.lock();
        state.enabled = enable;
        state.clear();
        info!("hg2 {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_params(&self, bin_width: i32, bin_count: usize) -> Result<(), Error> {
        check_range("hg2 bin width", bin_width, 1, MAX_HG2_BIN_WIDTH)?;
        check_range("hg2 bin count", bin_count, MIN_HG2_BIN_COUNT, MAX_HG2_BIN_COUNT)?;
        let mut state = self.state.lock();
        state.params = Hg2Params {
            bin_width,
            bin_count,
        };
        state.clear();
        info!("hg2 bin width {} ps, {} bins", bin_width, bin_count);
        Ok(())
    }

    pub fn params(&self) -> Hg2Params {
        self.state.lock().params
    }

    pub fn set_input(&self, idler: u8, signal1: u8, signal2: u8) -> Result<(), Error> {
        for &channel in &[idler, signal1, signal2] {
            check_range("hg2 channel", channel, 1, TDC_CHANNELS)?;
        }
        if idler == signal1 || idler == signal2 || signal1 == signal2 {
            return Err(Error::InvalidParameter(format!(
                "hg2 channels {}, {}, {} are not distinct",
                idler, signal1, signal2
            )));
        }
        let mut state = self.state.lock();
        state.input = Hg2Input {
            idler,
            signal1,
            signal2,
        };
        state.clear();
        info!("hg2 idler {}, signals {} and {}", idler, signal1, signal2);
        Ok(())
    }

    pub fn input(&self) -> Hg2Input {
        self.state.lock().input
    }

    pub fn reset(&self) {
        self.state.lock().clear();
    }

    fn enabled_state(&self) -> Result<parking_lot::MutexGuard<'_, Hg2State>, Error> {
        let state = self.state.lock();
        if state.enabled {
            Ok(state)
        } else {
            Err(Error::NotEnabled(String::from("HG2")))
        }
    }

    pub fn raw(&self) -> Result<Hg2Raw, Error> {
        let state = self.enabled_state()?;
        Ok(Hg2Raw {
            idler_events: state.idler_events,
            early_idlers: state.early_idlers,
            coinc_events: state.coinc_events,
            hist_signal1_idler: state.hist1.clone(),
            hist_signal2_idler: state.hist2.clone(),
        })
    }

    /// Heralded g2 function, `bin_count` values centered on zero delay.
    ///
    /// `g2[k] = idler_events * tcp[c][k] / (coinc_events * hist_signal2_idler[k])`
    /// with `c` the central bin, and 0 where the denominator vanishes.
    pub fn calc_g2(&self, reset: bool) -> Result<Vec<f64>, Error> {
        let mut state = self.enabled_state()?;
        let central = state.params.central_bin() as u32;
        let idler = state.idler_events as f64;
        let coinc = state.coinc_events as f64;
        let g2 = state
            .hist2
            .iter()
            .enumerate()
            .map(|(k, &s2)| {
                let denominator = coinc * s2 as f64;
                if denominator == 0. {
                    0.
                } else {
                    let triples = state.tcp.get(&(central, k as u32)).copied().unwrap_or(0);
                    idler * triples as f64 / denominator
                }
            })
            .collect();
        if reset {
            state.clear();
        }
        Ok(g2)
    }

    /// Triple coincidences, `tcp[[a, b]]` counts signal 1 at bin `a` and signal 2 at bin `b`.
    pub fn calc_tcp(&self, reset: bool) -> Result<Array2<i64>, Error> {
        let mut state = self.enabled_state()?;
        let tcp = state.tcp_matrix();
        if reset {
            state.clear();
        }
        Ok(tcp)
    }

    /// Triple coincidences flattened as `buffer[a + b * bin_count]`.
    pub fn calc_tcp_1d(&self, reset: bool) -> Result<Vec<i64>, Error> {
        let mut state = self.enabled_state()?;
        let tcp = state.tcp_flat();
        if reset {
            state.clear();
        }
        Ok(tcp)
    }
}

impl Default for Hg2Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for Hg2Engine {
    fn pausable(&self) -> bool {
        true
    }

    fn on_events(&self, events: &[Event]) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        for event in events {
            state.push(event);
        }
    }

    fn on_reset(&self) {
        self.state.lock().clear();
    }

    fn on_flush(&self) {
        let mut state = self.state.lock();
        if state.enabled {
            state.finalize_until(i64::MAX);
        }
    }
}
