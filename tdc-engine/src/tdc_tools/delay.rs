use std::collections::VecDeque;

use tracing::{info, warn};

use crate::errors::{check_range, Error};
use crate::headers::DeviceClass;
use crate::{Event, MARKER_FIRST, MARKER_LAST, START_CHANNEL, TDC_CHANNELS};

const DELAY_SLOTS: usize = TDC_CHANNELS as usize + 1;

/// Per channel delays and the channel enable mask, applied at ingestion.
///
/// Delayed events can overtake each other, so events are held back until no
/// later input can be sorted in front of them: with the most recent raw time
/// `t` and the smallest delay `d`, everything up to `t + d` is final. The
/// holdback therefore spans at most `max_delay - min_delay`.
pub struct DelayCompensator {
    device_class: DeviceClass,
    delays: [i32; DELAY_SLOTS],
    min_delay: i64,
    start_enabled: bool,
    channel_mask: u32,
    holdback: VecDeque<Event>,
    latest_raw: Option<i64>,
    // time of the last event handed downstream
    released: Option<i64>,
    order_violations: u64,
}

impl DelayCompensator {
    pub fn new(device_class: DeviceClass) -> Self {
        Self {
            device_class,
            delays: [0; DELAY_SLOTS],
            min_delay: 0,
            start_enabled: true,
            channel_mask: u32::MAX,
            holdback: VecDeque::new(),
            latest_raw: None,
            released: None,
            order_violations: 0,
        }
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    /// Sets the delay of a channel in ps; 0 is the start input.
    pub fn set_delay(&mut self, channel: u8, delay_ps: i32) -> Result<(), Error> {
        check_range("delay channel", channel, 0, TDC_CHANNELS)?;
        let max = self.device_class.max_delay_ps();
        check_range("channel delay", delay_ps, -max, max)?;
        self.delays[channel as usize] = delay_ps;
        self.min_delay = self.delays.iter().copied().min().unwrap_or(0).min(0) as i64;
        info!("channel {} delay {} ps", channel, delay_ps);
        Ok(())
    }

    pub fn delay(&self, channel: u8) -> Result<i32, Error> {
        check_range("delay channel", channel, 0, TDC_CHANNELS)?;
        Ok(self.delays[channel as usize])
    }

    /// Enables the start input and the stop channels set in `mask`, bit 0 being channel 1.
    pub fn enable_channels(&mut self, start: bool, mask: u32) {
        self.start_enabled = start;
        self.channel_mask = mask;
        info!("start {}, channel mask {:#010x}", start, mask);
    }

    pub fn channels_enabled(&self) -> (bool, u32) {
        (self.start_enabled, self.channel_mask)
    }

    /// Enabled stop channels in ascending order.
    pub fn enabled_stop_channels(&self) -> Vec<u8> {
        (1..=TDC_CHANNELS)
            .filter(|&ch| self.channel_mask & (1 << (ch - 1)) != 0)
            .collect()
    }

    #[inline]
    fn is_enabled(&self, channel: u8) -> bool {
        match channel {
            START_CHANNEL => self.start_enabled,
            ch if ch <= TDC_CHANNELS => self.channel_mask & (1 << (ch - 1)) != 0,
            // markers are never masked
            MARKER_FIRST..=MARKER_LAST => true,
            _ => false,
        }
    }

    #[inline]
    fn delay_of(&self, channel: u8) -> i64 {
        self.delays.get(channel as usize).copied().unwrap_or(0) as i64
    }

    /// Drops events of disabled channels without delaying; for replayed data.
    pub fn admit(&self, events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|e| self.is_enabled(e.channel))
            .copied()
            .collect()
    }

    /// Delays and reorders raw events; returns the events that became final.
    ///
    /// Output never goes back in time: after a delay change, events that would
    /// land before something already released are moved up to that time.
    pub fn apply(&mut self, events: &[Event]) -> Vec<Event> {
        for event in events {
            if !self.is_enabled(event.channel) {
                continue;
            }
            let latest_raw = self.latest_raw;
            match latest_raw {
                Some(latest) if event.time < latest => {
                    if self.order_violations == 0 {
                        warn!(
                            "timestamp {} on channel {} is older than {}",
                            event.time, event.channel, latest
                        );
                    }
                    self.order_violations += 1;
                }
                _ => self.latest_raw = Some(event.time),
            }

            let mut time = event.time + self.delay_of(event.channel);
            if let Some(released) = self.released {
                time = time.max(released);
            }
            let delayed = Event::new(time, event.channel);
            let mut pos = self.holdback.len();
            while pos > 0 && self.holdback[pos - 1].time > delayed.time {
                pos -= 1;
            }
            self.holdback.insert(pos, delayed);
        }

        let threshold = match self.latest_raw {
            Some(latest) => latest + self.min_delay,
            None => return Vec::new(),
        };
        let ready = self
            .holdback
            .iter()
            .take_while(|e| e.time <= threshold)
            .count();
        self.release(ready)
    }

    fn release(&mut self, count: usize) -> Vec<Event> {
        let out: Vec<Event> = self.holdback.drain(..count).collect();
        if let Some(last) = out.last() {
            self.released = Some(last.time);
        }
        out
    }

    /// Releases everything still held back.
    pub fn flush(&mut self) -> Vec<Event> {
        let pending = self.holdback.len();
        self.release(pending)
    }

    pub fn pending(&self) -> usize {
        self.holdback.len()
    }

    /// Raw events that arrived older than their predecessor.
    pub fn order_violations(&self) -> u64 {
        self.order_violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(events: &[Event]) -> Vec<(i64, u8)> {
        events.iter().map(|e| (e.time, e.channel)).collect()
    }

    #[test]
    fn no_delays_pass_through() {
        let mut comp = DelayCompensator::new(DeviceClass::Mc);
        let events = [Event::new(1, 1), Event::new(2, 0), Event::new(3, 104)];
        assert_eq!(comp.apply(&events), events.to_vec());
        assert_eq!(comp.pending(), 0);
    }

    #[test]
    fn delays_reorder() {
        let mut comp = DelayCompensator::new(DeviceClass::Mc);
        comp.set_delay(1, 100).unwrap();
        comp.set_delay(2, -50).unwrap();

        let out = comp.apply(&[Event::new(1_000, 1), Event::new(1_020, 2)]);
        // channel 2 at 970 is final, channel 1 at 1100 may still be overtaken
        assert_eq!(times(&out), vec![(970, 2)]);

        let out = comp.apply(&[Event::new(1_200, 2)]);
        assert_eq!(times(&out), vec![(1_100, 1), (1_150, 2)]);

        comp.apply(&[Event::new(1_300, 1)]);
        assert_eq!(times(&comp.flush()), vec![(1_400, 1)]);
    }

    #[test]
    fn lowering_a_delay_keeps_output_ordered() {
        let mut comp = DelayCompensator::new(DeviceClass::Mc);
        let mut out = comp.apply(&[Event::new(900, 1), Event::new(1_000, 2)]);
        assert_eq!(comp.pending(), 0);

        comp.set_delay(2, -50).unwrap();
        out.extend(comp.apply(&[Event::new(1_010, 2), Event::new(1_100, 1)]));
        out.extend(comp.flush());
        assert_eq!(
            times(&out),
            vec![(900, 1), (1_000, 2), (1_000, 2), (1_100, 1)]
        );
    }

    #[test]
    fn mask_drops_channels_but_not_markers() {
        let mut comp = DelayCompensator::new(DeviceClass::Hr);
        comp.enable_channels(false, 0b101);
        let events = [
            Event::new(1, 0),
            Event::new(2, 1),
            Event::new(3, 2),
            Event::new(4, 3),
            Event::new(5, 101),
            Event::new(6, 50),
        ];
        let expected = vec![Event::new(2, 1), Event::new(4, 3), Event::new(5, 101)];
        assert_eq!(comp.apply(&events), expected);
        assert_eq!(comp.admit(&events), expected);
        assert_eq!(comp.enabled_stop_channels(), vec![1, 3]);
        assert_eq!(comp.channels_enabled(), (false, 0b101));
    }

    #[test]
    fn delay_limits_follow_device_class() {
        let mut comp = DelayCompensator::new(DeviceClass::Mc);
        assert!(matches!(comp.set_delay(1, 50_001), Err(Error::InvalidParameter(_))));
        assert!(matches!(comp.set_delay(33, 0), Err(Error::InvalidParameter(_))));
        assert_eq!(comp.delay(1).unwrap(), 0);

        let mut comp = DelayCompensator::new(DeviceClass::Hr);
        comp.set_delay(1, -100_000).unwrap();
        assert_eq!(comp.delay(1).unwrap(), -100_000);
    }

    #[test]
    fn out_of_order_input_is_counted() {
        let mut comp = DelayCompensator::new(DeviceClass::Mc);
        let out = comp.apply(&[Event::new(10, 1), Event::new(5, 2), Event::new(20, 1)]);
        assert_eq!(comp.order_violations(), 1);
        assert_eq!(out.len(), 3);
    }
}
