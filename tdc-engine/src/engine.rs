use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, span, warn, Level};

use crate::codec::{self, StreamHeader, StreamWriter};
use crate::errors::Error;
use crate::headers::{DeviceClass, FeatureFlags, FileFormat};
use crate::simulation::{SimParams, TimestampGenerator};
use crate::source::EventSource;
use crate::tdc_tools::circular_buffer::{RingSnapshot, TimestampRingBuffer};
use crate::tdc_tools::coincidence::{CoincParams, CoincSnapshot, CoincidenceCounter};
use crate::tdc_tools::delay::DelayCompensator;
use crate::tdc_tools::freeze::FreezeController;
use crate::tdc_tools::hg2::{Hg2Engine, Hg2Input, Hg2Params};
use crate::tdc_tools::startstop::{HistParams, HistogramEngine};
use crate::{Event, EventSink, TIMEBASE};

/// Complete configuration of an [`Engine`], loadable from JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub device_class: DeviceClass,
    pub features: FeatureFlags,
    pub start_enabled: bool,
    pub channel_mask: u32,
    /// `(channel, delay in ps)`
    pub delays: Vec<(u8, i32)>,
    /// Timestamp ring buffer size, 0 leaves it disabled
    pub buffer_size: usize,
    pub coincidence: CoincParams,
    pub histogram: HistParams,
    pub histograms_enabled: bool,
    pub single_stop: bool,
    /// `(start, stop)` channel pairs
    pub histograms: Vec<(u8, u8)>,
    pub hg2_enabled: bool,
    pub hg2: Hg2Params,
    pub hg2_input: Hg2Input,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::default(),
            features: FeatureFlags(FeatureFlags::HBT | FeatureFlags::LIFETIME),
            start_enabled: true,
            channel_mask: u32::MAX,
            delays: Vec::new(),
            buffer_size: 0,
            coincidence: CoincParams::default(),
            histogram: HistParams::default(),
            histograms_enabled: false,
            single_stop: false,
            histograms: Vec::new(),
            hg2_enabled: false,
            hg2: Hg2Params::default(),
            hg2_input: Hg2Input::default(),
        }
    }
}

/// Counters of the ingestion path.
#[derive(Serialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Batches fanned out to the accumulators
    pub batches: u64,
    /// Events fanned out to the accumulators
    pub events: u64,
    /// Device events dropped because the TDC input was disabled
    pub input_dropped: u64,
    /// Batches the file writer could not take
    pub writer_dropped: u64,
    /// Raw events older than their predecessor
    pub order_violations: u64,
}

struct SourceHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

/// Single ingestion point of the event stream.
///
/// Device events pass the [`DelayCompensator`] and are fanned out batch by
/// batch to the timestamp buffer, the coincidence counters, the start stop
/// histograms, hg2 and, while recording, the file writer. Replayed files skip
/// the delay compensation since they were recorded after it.
pub struct Engine {
    compensator: Mutex<DelayCompensator>,
    freeze: FreezeController,
    ring: Arc<TimestampRingBuffer>,
    coincidences: Arc<CoincidenceCounter>,
    histograms: Arc<HistogramEngine>,
    hg2: Arc<Hg2Engine>,
    sinks: Vec<Arc<dyn EventSink>>,
    writer: Mutex<Option<StreamWriter>>,
    data_lost: AtomicBool,
    data_lost_latched: AtomicBool,
    features: AtomicU32,
    tdc_input: AtomicBool,
    last_time: AtomicI64,
    stats: Mutex<IngestStats>,
    source: Mutex<Option<SourceHandle>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::build(DeviceClass::default(), FeatureFlags(FeatureFlags::HBT | FeatureFlags::LIFETIME))
    }

    fn build(device_class: DeviceClass, features: FeatureFlags) -> Self {
        let ring = Arc::new(TimestampRingBuffer::new());
        let coincidences = Arc::new(CoincidenceCounter::new());
        let histograms = Arc::new(HistogramEngine::new());
        let hg2 = Arc::new(Hg2Engine::new());
        let sinks: Vec<Arc<dyn EventSink>> = vec![
            ring.clone(),
            coincidences.clone(),
            histograms.clone(),
            hg2.clone(),
        ];
        Self {
            compensator: Mutex::new(DelayCompensator::new(device_class)),
            freeze: FreezeController::new(),
            ring,
            coincidences,
            histograms,
            hg2,
            sinks,
            writer: Mutex::new(None),
            data_lost: AtomicBool::new(false),
            data_lost_latched: AtomicBool::new(false),
            features: AtomicU32::new(features.0),
            tdc_input: AtomicBool::new(true),
            last_time: AtomicI64::new(0),
            stats: Mutex::new(IngestStats::default()),
            source: Mutex::new(None),
        }
    }

    pub fn with_config(config: &EngineConfig) -> Result<Self, Error> {
        let engine = Self::build(config.device_class, config.features);
        {
            let mut compensator = engine.compensator.lock();
            compensator.enable_channels(config.start_enabled, config.channel_mask);
            for &(channel, delay) in &config.delays {
                compensator.set_delay(channel, delay)?;
            }
        }
        if config.buffer_size > 0 {
            engine.ring.set_capacity(config.buffer_size)?;
        }
        engine
            .coincidences
            .configure(config.coincidence.window_ps, config.coincidence.exposure_ms)?;

        engine
            .histograms
            .set_params(config.histogram.bin_width, config.histogram.bin_count)?;
        engine.histograms.preselect_single_stop(config.single_stop);
        for &(start, stop) in &config.histograms {
            engine.histograms.add_histogram(start, stop)?;
        }
        engine.histograms.enable(config.histograms_enabled);

        engine.hg2.set_params(config.hg2.bin_width, config.hg2.bin_count)?;
        let Hg2Input {
            idler,
            signal1,
            signal2,
        } = config.hg2_input;
        engine.hg2.set_input(idler, signal1, signal2)?;
        engine.hg2.enable(config.hg2_enabled);
        Ok(engine)
    }

    /// Current configuration.
    pub fn config(&self) -> EngineConfig {
        let compensator = self.compensator.lock();
        let (start_enabled, channel_mask) = compensator.channels_enabled();
        let delays = (0..=crate::TDC_CHANNELS)
            .filter_map(|ch| match compensator.delay(ch) {
                Ok(0) | Err(_) => None,
                Ok(delay) => Some((ch, delay)),
            })
            .collect();
        EngineConfig {
            device_class: compensator.device_class(),
            features: self.features(),
            start_enabled,
            channel_mask,
            delays,
            buffer_size: self.ring.capacity(),
            coincidence: self.coincidences.params(),
            histogram: self.histograms.params(),
            histograms_enabled: self.histograms.is_enabled(),
            single_stop: self.histograms.single_stop(),
            histograms: self.histograms.histograms(),
            hg2_enabled: self.hg2.is_enabled(),
            hg2: self.hg2.params(),
            hg2_input: self.hg2.input(),
        }
    }

    // - - - - - - //
    //  Ingestion  //
    // - - - - - - //

    fn fan_out(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        for sink in &self.sinks {
            if self.freeze.admits(sink.as_ref()) {
                sink.on_events(events);
            }
        }

        let mut writer_dropped = false;
        if let Some(writer) = self.writer.lock().as_ref() {
            let accepted = writer.submit(Arc::new(events.to_vec()));
            self.data_lost.store(!accepted, Ordering::SeqCst);
            if !accepted {
                self.data_lost_latched.store(true, Ordering::SeqCst);
                writer_dropped = true;
            }
        }

        if let Some(last) = events.last() {
            self.last_time.fetch_max(last.time, Ordering::SeqCst);
        }
        let mut stats = self.stats.lock();
        stats.batches += 1;
        stats.events += events.len() as u64;
        if writer_dropped {
            stats.writer_dropped += 1;
        }
    }

    fn process_raw(&self, events: &[Event]) {
        let released = {
            let mut compensator = self.compensator.lock();
            let released = compensator.apply(events);
            self.stats.lock().order_violations = compensator.order_violations();
            released
        };
        self.fan_out(&released);
    }

    /// Raw events from the device, delay compensated on the way in.
    ///
    /// Dropped while the TDC input is disabled.
    pub fn deliver(&self, events: &[Event]) {
        if !self.tdc_input.load(Ordering::SeqCst) {
            self.stats.lock().input_dropped += events.len() as u64;
            return;
        }
        self.process_raw(events);
    }

    /// Synthetic events, processed like raw device data.
    pub fn input_timestamps(&self, timestamps: &[i64], channels: &[u8]) -> Result<(), Error> {
        if timestamps.len() != channels.len() {
            return Err(Error::InvalidParameter(format!(
                "{} timestamps but {} channels",
                timestamps.len(),
                channels.len()
            )));
        }
        let events: Vec<Event> = timestamps
            .iter()
            .zip(channels)
            .map(|(&time, &channel)| Event::new(time, channel))
            .collect();
        self.process_raw(&events);
        Ok(())
    }

    /// Generates `count` random timestamps on the enabled stop channels,
    /// continuing after the last processed event. Returns the number generated.
    pub fn generate_timestamps(&self, params: SimParams, count: usize) -> Result<usize, Error> {
        let channels = self.compensator.lock().enabled_stop_channels();
        let start = self.last_time.load(Ordering::SeqCst);
        let mut generator = TimestampGenerator::new(params, channels, start, None)?;
        let events = generator.generate(count);
        self.process_raw(&events);
        debug!("generated {} timestamps", events.len());
        Ok(events.len())
    }

    /// Replays a timestamp file through the accumulators.
    ///
    /// The channel mask applies, delays do not. Feature flags stored in the file
    /// header replace the engine's. Returns the number of events read.
    pub fn read_timestamps<P: AsRef<Path>>(&self, path: P, hint: FileFormat) -> Result<u64, Error> {
        let path = path.as_ref();
        let span = span!(Level::INFO, "replay", file = %path.display());
        let _enter = span.enter();

        let mut reader = codec::open(path, hint)?;
        if let Some(features) = reader.features() {
            self.set_features(features);
        }
        let mut count = 0;
        while let Some(batch) = reader.next_batch() {
            count += batch.len() as u64;
            let admitted = self.compensator.lock().admit(&batch);
            self.fan_out(&admitted);
        }
        self.flush_sinks();
        if reader.skipped_records() > 0 {
            warn!("{} records could not be decoded", reader.skipped_records());
        }
        info!("replayed {} events", count);
        Ok(count)
    }

    fn flush_sinks(&self) {
        for sink in &self.sinks {
            if self.freeze.admits(sink.as_ref()) {
                sink.on_flush();
            }
        }
    }

    /// End of stream: releases events held back for delay compensation and
    /// finalizes state that waits for future events.
    pub fn flush(&self) {
        let released = self.compensator.lock().flush();
        self.fan_out(&released);
        self.flush_sinks();
    }

    // - - - - - - - //
    //  Event source  //
    // - - - - - - - //

    /// Drains `source` on a producer thread. Sources with a file header are
    /// treated as recordings and skip the delay compensation.
    ///
    /// A previously attached source is stopped first.
    pub fn attach_source(self: &Arc<Self>, mut source: Box<dyn EventSource>) -> Result<(), Error> {
        if self.source_running() {
            self.stop_source()?;
        }
        let replay = match source.header() {
            Some(header) => {
                self.set_features(header.features);
                true
            }
            None => false,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("tdc-source"))
            .spawn(move || {
                let mut count = 0u64;
                while !thread_stop.load(Ordering::SeqCst) {
                    let batch = match source.next_batch() {
                        Some(batch) => batch,
                        None => break,
                    };
                    count += batch.len() as u64;
                    if replay {
                        let admitted = engine.compensator.lock().admit(&batch);
                        engine.fan_out(&admitted);
                    } else {
                        engine.deliver(&batch);
                    }
                }
                engine.flush();
                debug!("source finished after {} events", count);
                count
            })?;

        *self.source.lock() = Some(SourceHandle { stop, handle });
        info!("event source attached");
        Ok(())
    }

    pub fn source_running(&self) -> bool {
        self.source.lock().is_some()
    }

    fn join_source(&self, stop: bool) -> Result<u64, Error> {
        let source = self.source.lock().take().ok_or(Error::NoDataSource)?;
        if stop {
            source.stop.store(true, Ordering::SeqCst);
        }
        source.handle.join().map_err(|_| {
            Error::IOError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "event source thread panicked",
            ))
        })
    }

    /// Stops the attached source; returns the number of events it delivered.
    pub fn stop_source(&self) -> Result<u64, Error> {
        let count = self.join_source(true)?;
        info!("event source stopped");
        Ok(count)
    }

    /// Waits until the attached source is exhausted.
    pub fn wait_source(&self) -> Result<u64, Error> {
        self.join_source(false)
    }

    // - - - - - - - - - //
    //  File recording  //
    // - - - - - - - - - //

    /// Starts writing every processed event to `path`. An empty path or
    /// `FileFormat::None` stops writing instead.
    pub fn write_timestamps<P: AsRef<Path>>(&self, path: P, format: FileFormat) -> Result<(), Error> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || format == FileFormat::None {
            self.stop_writing();
            return Ok(());
        }
        let header = StreamHeader::new(format, self.features(), self.device_class());
        let writer = StreamWriter::create(path, format, header)?;
        let previous = self.writer.lock().replace(writer);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Stops writing; returns the number of records written, if a file was open.
    pub fn stop_writing(&self) -> Option<u64> {
        let writer = self.writer.lock().take();
        writer.map(|w| w.stop())
    }

    pub fn is_writing(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// If data was lost, now or since the previous call. Clears the latch.
    pub fn data_lost(&self) -> bool {
        let latched = self.data_lost_latched.swap(false, Ordering::SeqCst);
        self.data_lost.load(Ordering::SeqCst) || latched
    }

    // - - - - - - - - //
    //  Configuration  //
    // - - - - - - - - //

    pub fn set_channel_delay(&self, channel: u8, delay_ps: i32) -> Result<(), Error> {
        self.compensator.lock().set_delay(channel, delay_ps)
    }

    pub fn channel_delay(&self, channel: u8) -> Result<i32, Error> {
        self.compensator.lock().delay(channel)
    }

    pub fn enable_channels(&self, start: bool, mask: u32) {
        self.compensator.lock().enable_channels(start, mask);
    }

    pub fn channels_enabled(&self) -> (bool, u32) {
        self.compensator.lock().channels_enabled()
    }

    /// Enables device input; software input is not affected.
    pub fn enable_tdc_input(&self, enable: bool) {
        self.tdc_input.store(enable, Ordering::SeqCst);
        info!("tdc input {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn tdc_input_enabled(&self) -> bool {
        self.tdc_input.load(Ordering::SeqCst)
    }

    pub fn freeze_buffers(&self, freeze: bool) {
        self.freeze.freeze(freeze);
    }

    pub fn buffers_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    pub fn set_timestamp_buffer_size(&self, size: usize) -> Result<(), Error> {
        self.ring.set_capacity(size)
    }

    pub fn timestamp_buffer_size(&self) -> usize {
        self.ring.capacity()
    }

    pub fn last_timestamps(&self, reset: bool) -> RingSnapshot {
        self.ring.read(reset)
    }

    pub fn set_coincidence_params(&self, window_ps: i64, exposure_ms: u32) -> Result<(), Error> {
        self.coincidences.configure(window_ps, exposure_ms)
    }

    pub fn coincidence_params(&self) -> CoincParams {
        self.coincidences.params()
    }

    pub fn coinc_counters(&self) -> CoincSnapshot {
        self.coincidences.read()
    }

    pub fn histograms(&self) -> &HistogramEngine {
        &self.histograms
    }

    pub fn hg2(&self) -> &Hg2Engine {
        &self.hg2
    }

    /// Clears every accumulator; configuration is kept.
    pub fn reset(&self) {
        for sink in &self.sinks {
            sink.on_reset();
        }
        debug!("accumulators cleared");
    }

    pub fn features(&self) -> FeatureFlags {
        FeatureFlags(self.features.load(Ordering::SeqCst))
    }

    pub fn set_features(&self, features: FeatureFlags) {
        self.features.store(features.0, Ordering::SeqCst);
        debug!("features {}", features);
    }

    pub fn device_class(&self) -> DeviceClass {
        self.compensator.lock().device_class()
    }

    /// Time base of all timestamps in seconds.
    pub fn timebase(&self) -> f64 {
        TIMEBASE
    }

    pub fn stats(&self) -> IngestStats {
        *self.stats.lock()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // the producer thread owns a reference to the engine, so this may run on
        // that very thread; signal it instead of joining
        if let Some(source) = self.source.get_mut().take() {
            source.stop.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;

    #[test]
    fn fan_out_reaches_all_accumulators() {
        let engine = Engine::new();
        engine.set_timestamp_buffer_size(10).unwrap();
        engine.set_coincidence_params(100, 0).unwrap();
        engine.histograms().add_histogram(1, 2).unwrap();
        engine.histograms().enable(true);

        engine
            .input_timestamps(&[0, 50, 70], &[1, 2, 3])
            .unwrap();
        assert_eq!(engine.last_timestamps(false).valid, 3);
        assert_eq!(engine.coinc_counters().counters[33], 1);
        assert_eq!(engine.histograms().read(1, 2, false).unwrap().counts, 1);
        assert_eq!(engine.stats().events, 3);
    }

    #[test]
    fn input_lengths_must_match() {
        let engine = Engine::new();
        assert!(matches!(
            engine.input_timestamps(&[1, 2], &[1]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn freeze_stops_pausable_sinks() {
        let engine = Engine::new();
        engine.set_timestamp_buffer_size(10).unwrap();
        engine.set_coincidence_params(100, 0).unwrap();
        engine.freeze_buffers(true);
        engine.input_timestamps(&[0, 10], &[1, 2]).unwrap();
        assert_eq!(engine.last_timestamps(false).valid, 0);
        assert_eq!(engine.coinc_counters().counters[1], 1);
        engine.freeze_buffers(false);
        engine.input_timestamps(&[20], &[1]).unwrap();
        assert_eq!(engine.last_timestamps(false).valid, 1);
    }

    #[test]
    fn tdc_input_gate() {
        let engine = Engine::new();
        engine.set_timestamp_buffer_size(10).unwrap();
        engine.enable_tdc_input(false);
        engine.deliver(&[Event::new(1, 1)]);
        assert_eq!(engine.stats().input_dropped, 1);
        engine.input_timestamps(&[2], &[1]).unwrap();
        assert_eq!(engine.last_timestamps(false).valid, 1);
    }

    #[test]
    fn source_lifecycle() {
        let engine = Arc::new(Engine::new());
        engine.set_timestamp_buffer_size(100).unwrap();
        assert!(matches!(engine.stop_source(), Err(Error::NoDataSource)));

        let events: Vec<Event> = (0..50).map(|t| Event::new(t * 10, 1)).collect();
        engine
            .attach_source(Box::new(VecSource::chunked(&events, 7)))
            .unwrap();
        assert_eq!(engine.wait_source().unwrap(), 50);
        assert_eq!(engine.last_timestamps(false).valid, 50);
        assert!(!engine.source_running());
    }

    #[test]
    fn generated_timestamps_use_enabled_channels() {
        let engine = Engine::new();
        engine.set_timestamp_buffer_size(1_000).unwrap();
        engine.enable_channels(false, 0b100);
        let n = engine.generate_timestamps(SimParams::default(), 100).unwrap();
        assert_eq!(n, 100);
        let snapshot = engine.last_timestamps(false);
        assert!(snapshot.channels().iter().all(|&ch| ch == 3));

        engine.enable_channels(true, 0);
        assert!(matches!(
            engine.generate_timestamps(SimParams::default(), 1),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn config_round_trip() {
        let mut config = EngineConfig::default();
        config.delays = vec![(2, 300)];
        config.buffer_size = 16;
        config.histograms = vec![(0, 1)];
        config.histograms_enabled = true;
        config.hg2_enabled = true;
        let engine = Engine::with_config(&config).unwrap();
        assert_eq!(engine.config(), config);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let partial: EngineConfig = serde_json::from_str(r#"{"buffer_size": 5}"#).unwrap();
        assert_eq!(partial.buffer_size, 5);
        assert_eq!(partial.hg2, Hg2Params::default());

        config.delays = vec![(2, 1_000_000)];
        assert!(Engine::with_config(&config).is_err());
    }
}
