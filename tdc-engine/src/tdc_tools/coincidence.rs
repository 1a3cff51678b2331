use bit_iter::BitIter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{check_range, Error};
use crate::{Event, EventSink, TDC_CHANNELS};

/// Number of counters: 33 singles followed by the 26 coincidence combinations
pub const COINC_COUNTERS: usize = 59;
/// Coincidences are evaluated between the stop channels 1..=COINC_CHANNELS
pub const COINC_CHANNELS: u8 = 5;
const SINGLES: usize = TDC_CHANNELS as usize + 1;
const MASKS: usize = 1 << COINC_CHANNELS;

pub const MAX_COINC_WINDOW_PS: i64 = 2_000_000_000;
pub const MAX_EXPOSURE_MS: u32 = 65_535;
const PS_PER_MS: i64 = 1_000_000_000;

/// Parameters of the coincidence counters
///
/// # Parameters
///    - window_ps: events on different channels within this time of each other are coincident
///    - exposure_ms: length of one counting period; 0 disables periodic publishing
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoincParams {
    pub window_ps: i64,
    pub exposure_ms: u32,
}

impl Default for CoincParams {
    fn default() -> Self {
        Self {
            window_ps: 1_000,
            exposure_ms: 100,
        }
    }
}

/// Counter values of the last completed exposure period.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoincSnapshot {
    pub counters: [u32; COINC_COUNTERS],
    /// Periods completed since the previous read
    pub updates: u32,
}

/// Counter index of every channel mask with at least two bits set.
///
/// Combinations are ordered by size, and within one size by mask value:
/// 1/2, 1/3, 2/3, 1/4, ... 1/2/3, 1/2/4, ... 1/2/3/4/5.
fn coincidence_slots() -> [usize; MASKS] {
    let mut slots = [0; MASKS];
    let mut next = SINGLES;
    for size in 2..=COINC_CHANNELS as u32 {
        for mask in 1..MASKS {
            if (mask as u32).count_ones() == size {
                slots[mask] = next;
                next += 1;
            }
        }
    }
    slots
}

/// Human readable name of a counter, e.g. `"7"` or `"1/2/4"`.
pub fn counter_label(index: usize) -> Option<String> {
    if index < SINGLES {
        return Some(index.to_string());
    }
    let slots = coincidence_slots();
    let mask = (3..MASKS).find(|&m| (m as u32).count_ones() >= 2 && slots[m] == index)?;
    let channels: Vec<String> = BitIter::from(mask as u32)
        .map(|bit| (bit + 1).to_string())
        .collect();
    Some(channels.join("/"))
}

struct CoincState {
    params: CoincParams,
    working: [u32; COINC_COUNTERS],
    published: [u32; COINC_COUNTERS],
    updates: u32,
    period_start: Option<i64>,
    // latest event per coincidence channel
    last_seen: [Option<i64>; COINC_CHANNELS as usize],
}

impl CoincState {
    fn new(params: CoincParams) -> Self {
        Self {
            params,
            working: [0; COINC_COUNTERS],
            published: [0; COINC_COUNTERS],
            updates: 0,
            period_start: None,
            last_seen: [None; COINC_CHANNELS as usize],
        }
    }

    /// Channels other than `channel` whose latest event lies within the window before `time`.
    fn open_channels(&self, channel: u8, time: i64) -> u32 {
        let window_ps = self.params.window_ps;
        self.last_seen
            .iter()
            .enumerate()
            .filter(|&(idx, _)| idx + 1 != channel as usize)
            .filter_map(|(idx, seen)| match seen {
                Some(t) if time - t <= window_ps => Some(1 << idx),
                _ => None,
            })
            .fold(0, |mask, bit| mask | bit)
    }
}

/// Singles and windowed coincidence counters, published once per exposure period.
///
/// The latest event of each of the channels 1..=5 stays open for `window_ps`.
/// An incoming event is coincident with every open channel, and each
/// combination of it with a non empty subset of those channels counts once.
/// A triple 1/2/3 thus increments 1/2 when 2 arrives and 1/3, 2/3 and 1/2/3
/// when 3 arrives. Periods are measured in stream time.
pub struct CoincidenceCounter {
    state: Mutex<CoincState>,
    slots: [usize; MASKS],
}

impl CoincidenceCounter {
    pub fn new() -> Self {
        Self::with_params(CoincParams::default())
    }

    pub fn with_params(params: CoincParams) -> Self {
        Self {
            state: Mutex::new(CoincState::new(params)),
            slots: coincidence_slots(),
        }
    }

    /// Sets window and exposure time; the counters restart from zero.
    pub fn configure(&self, window_ps: i64, exposure_ms: u32) -> Result<(), Error> {
        check_range("coincidence window", window_ps, 0, MAX_COINC_WINDOW_PS)?;
        check_range("exposure time", exposure_ms, 0, MAX_EXPOSURE_MS)?;
        let params = CoincParams {
            window_ps,
            exposure_ms,
        };
        *self.state.lock() = CoincState::new(params);
        info!("coincidence window {} ps, exposure {} ms", window_ps, exposure_ms);
        Ok(())
    }

    pub fn params(&self) -> CoincParams {
        self.state.lock().params
    }

    pub fn read(&self) -> CoincSnapshot {
        let mut state = self.state.lock();
        let updates = std::mem::replace(&mut state.updates, 0);
        let counters = if state.params.exposure_ms > 0 {
            state.published
        } else {
            state.working
        };
        CoincSnapshot { counters, updates }
    }

    /// Counts `bit` together with every non empty subset of `open`.
    fn count_coincidences(&self, counters: &mut [u32; COINC_COUNTERS], bit: u32, open: u32) {
        let mut sub = open;
        while sub != 0 {
            let slot = self.slots[(sub | bit) as usize];
            counters[slot] = counters[slot].wrapping_add(1);
            sub = (sub - 1) & open;
        }
    }

    fn advance_period(&self, state: &mut CoincState, time: i64) {
        if state.params.exposure_ms == 0 {
            return;
        }
        let period = state.params.exposure_ms as i64 * PS_PER_MS;
        let start = match state.period_start {
            Some(start) => start,
            None => {
                state.period_start = Some(time);
                return;
            }
        };
        let elapsed = (time - start).div_euclid(period);
        if elapsed < 1 {
            return;
        }

        state.published = state.working;
        state.working = [0; COINC_COUNTERS];
        if elapsed > 1 {
            state.published = [0; COINC_COUNTERS];
        }
        state.updates = state.updates.wrapping_add(elapsed.min(u32::MAX as i64) as u32);
        state.period_start = Some(start + elapsed * period);
    }
}

impl Default for CoincidenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CoincidenceCounter {
    fn pausable(&self) -> bool {
        false
    }

    fn on_events(&self, events: &[Event]) {
        let mut state = self.state.lock();
        for event in events {
            self.advance_period(&mut state, event.time);

            if event.channel as usize >= SINGLES {
                continue;
            }
            let single = &mut state.working[event.channel as usize];
            *single = single.wrapping_add(1);

            if event.channel < 1 || event.channel > COINC_CHANNELS {
                continue;
            }
            let open = state.open_channels(event.channel, event.time);
            if open != 0 {
                self.count_coincidences(&mut state.working, 1 << (event.channel - 1), open);
            }
            state.last_seen[event.channel as usize - 1] = Some(event.time);
        }
    }

    fn on_reset(&self) {
        let mut state = self.state.lock();
        let params = state.params;
        *state = CoincState::new(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_counter(window_ps: i64) -> CoincidenceCounter {
        let counter = CoincidenceCounter::new();
        counter.configure(window_ps, 0).unwrap();
        counter
    }

    fn label_index(label: &str) -> usize {
        (0..COINC_COUNTERS)
            .find(|&i| counter_label(i).as_deref() == Some(label))
            .unwrap()
    }

    #[test]
    fn counter_order() {
        let labels: Vec<String> = (SINGLES..COINC_COUNTERS)
            .map(|i| counter_label(i).unwrap())
            .collect();
        let expected = [
            "1/2", "1/3", "2/3", "1/4", "2/4", "3/4", "1/5", "2/5", "3/5", "4/5", "1/2/3",
            "1/2/4", "1/3/4", "2/3/4", "1/2/5", "1/3/5", "2/3/5", "1/4/5", "2/4/5", "3/4/5",
            "1/2/3/4", "1/2/3/5", "1/2/4/5", "1/3/4/5", "2/3/4/5", "1/2/3/4/5",
        ];
        assert_eq!(labels, expected);
        assert_eq!(counter_label(0).unwrap(), "0");
        assert_eq!(counter_label(COINC_COUNTERS), None);
    }

    #[test]
    fn pair_within_window() {
        let counter = live_counter(1_000);
        counter.on_events(&[Event::new(0, 1), Event::new(500, 2)]);
        let snapshot = counter.read();
        assert_eq!(snapshot.counters[1], 1);
        assert_eq!(snapshot.counters[2], 1);
        assert_eq!(snapshot.counters[label_index("1/2")], 1);
        assert_eq!(snapshot.updates, 0);
    }

    #[test]
    fn pair_outside_window() {
        let counter = live_counter(1_000);
        counter.on_events(&[Event::new(0, 1), Event::new(1_001, 2)]);
        let snapshot = counter.read();
        assert_eq!(snapshot.counters[label_index("1/2")], 0);
        assert_eq!(snapshot.counters[1] + snapshot.counters[2], 2);
    }

    #[test]
    fn window_is_inclusive() {
        let counter = live_counter(1_000);
        counter.on_events(&[Event::new(0, 3), Event::new(1_000, 4)]);
        assert_eq!(counter.read().counters[label_index("3/4")], 1);
    }

    #[test]
    fn latest_event_of_a_channel_opens_the_window() {
        let counter = live_counter(100);
        counter.on_events(&[Event::new(0, 1), Event::new(60, 1), Event::new(150, 2)]);
        let counters = counter.read().counters;
        assert_eq!(counters[1], 2);
        assert_eq!(counters[label_index("1/2")], 1);
    }

    #[test]
    fn window_slides_along_the_stream() {
        let counter = live_counter(100);
        counter.on_events(&[Event::new(0, 2), Event::new(90, 3), Event::new(150, 4)]);
        let counters = counter.read().counters;
        assert_eq!(counters[label_index("2/3")], 1);
        assert_eq!(counters[label_index("3/4")], 1);
        assert_eq!(counters[label_index("2/4")], 0);
        assert_eq!(counters[label_index("2/3/4")], 0);
    }

    #[test]
    fn triple_counts_all_subsets() {
        let counter = live_counter(1_000);
        counter.on_events(&[
            Event::new(0, 1),
            Event::new(100, 2),
            Event::new(200, 3),
            Event::new(5_000, 1),
        ]);
        let counters = counter.read().counters;
        for label in &["1/2", "1/3", "2/3", "1/2/3"] {
            assert_eq!(counters[label_index(label)], 1, "{}", label);
        }
        assert_eq!(counters[label_index("1/4")], 0);
        assert_eq!(counters[1], 2);
    }

    #[test]
    fn exposure_publishes_periods() {
        let counter = CoincidenceCounter::new();
        counter.configure(1_000, 1).unwrap();
        let ms = PS_PER_MS;
        counter.on_events(&[
            Event::new(0, 1),
            Event::new(10, 2),
            Event::new(ms / 2, 7),
            Event::new(ms + 1, 1),
        ]);
        let snapshot = counter.read();
        assert_eq!(snapshot.updates, 1);
        assert_eq!(snapshot.counters[1], 1);
        assert_eq!(snapshot.counters[7], 1);
        assert_eq!(snapshot.counters[label_index("1/2")], 1);

        // nothing new was published
        assert_eq!(counter.read().updates, 0);

        // skipping several periods publishes empty counters
        counter.on_events(&[Event::new(5 * ms, 2)]);
        let snapshot = counter.read();
        assert_eq!(snapshot.updates, 4);
        assert_eq!(snapshot.counters, [0; COINC_COUNTERS]);
    }

    #[test]
    fn configure_validates() {
        let counter = CoincidenceCounter::new();
        assert!(matches!(
            counter.configure(-1, 10),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            counter.configure(10, MAX_EXPOSURE_MS + 1),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(counter.params(), CoincParams::default());
    }

    #[test]
    fn start_channel_counts_as_single_only() {
        let counter = live_counter(1_000);
        counter.on_events(&[Event::new(0, 0), Event::new(1, 1), Event::new(2, 104)]);
        let counters = counter.read().counters;
        assert_eq!(counters[0], 1);
        assert_eq!(counters[1], 1);
        assert_eq!(counters[SINGLES..].iter().sum::<u32>(), 0);
    }
}
