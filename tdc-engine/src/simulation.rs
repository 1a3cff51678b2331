use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::source::EventSource;
use crate::Event;

/// Distribution of the time differences between generated events.
#[derive(FromPrimitive, ToPrimitive, Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimType {
    /// Uniform in `center ± width / 2`
    Flat = 0,
    /// Normal with mean `center` and standard deviation `width`
    Normal = 1,
}

/// Parameters of synthetic timestamp generation.
///
/// # Parameters
/// - sim_type: distribution of the time differences
/// - center: center of the distribution in ps
/// - width: width of the distribution in ps
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct SimParams {
    pub sim_type: SimType,
    pub center: f64,
    pub width: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            sim_type: SimType::Flat,
            center: 100_000.,
            width: 50_000.,
        }
    }
}

/// Random timestamps on a set of channels.
///
/// Consecutive events are separated by a difference drawn from the configured
/// distribution; negative draws are dropped, so fewer events than requested
/// may come out. Channels are picked uniformly.
pub struct TimestampGenerator {
    params: SimParams,
    channels: Vec<u8>,
    rng: StdRng,
    time: i64,
}

impl TimestampGenerator {
    pub fn new(
        params: SimParams,
        channels: Vec<u8>,
        start_time: i64,
        seed: Option<u64>,
    ) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::InvalidParameter(String::from(
                "at least one channel has to be enabled",
            )));
        }
        if !params.center.is_finite() || !params.width.is_finite() || params.width < 0. {
            return Err(Error::InvalidParameter(format!(
                "invalid distribution center {} width {}",
                params.center, params.width
            )));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            params,
            channels,
            rng,
            time: start_time,
        })
    }

    /// Time of the last generated event.
    pub fn time(&self) -> i64 {
        self.time
    }

    fn draw_difference(&mut self) -> f64 {
        let SimParams { center, width, .. } = self.params;
        match self.params.sim_type {
            SimType::Flat => center + width * (self.rng.gen::<f64>() - 0.5),
            SimType::Normal => {
                // Box-Muller
                let u1 = 1. - self.rng.gen::<f64>();
                let u2 = self.rng.gen::<f64>();
                let z = (-2. * u1.ln()).sqrt() * (2. * std::f64::consts::PI * u2).cos();
                center + width * z
            }
        }
    }

    /// Draws `count` differences and returns the resulting events.
    pub fn generate(&mut self, count: usize) -> Vec<Event> {
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let diff = self.draw_difference().round();
            if diff < 0. {
                continue;
            }
            self.time = self.time.saturating_add(diff as i64);
            let channel = *self.channels.choose(&mut self.rng).unwrap_or(&1);
            events.push(Event::new(self.time, channel));
        }
        events
    }
}

/// [`EventSource`] drawing a fixed number of timestamps in batches.
pub struct SyntheticSource {
    generator: TimestampGenerator,
    remaining: usize,
    batch_size: usize,
}

impl SyntheticSource {
    pub fn new(generator: TimestampGenerator, count: usize, batch_size: usize) -> Self {
        Self {
            generator,
            remaining: count,
            batch_size: batch_size.max(1),
        }
    }
}

impl EventSource for SyntheticSource {
    fn next_batch(&mut self) -> Option<Vec<Event>> {
        if self.remaining == 0 {
            return None;
        }
        let n = self.remaining.min(self.batch_size);
        self.remaining -= n;
        Some(self.generator.generate(n))
    }
}
