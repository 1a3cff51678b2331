use std::sync::Arc;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::errors::Error;
use crate::headers::FileFormat;
use crate::simulation::{SimParams, SimType};
use crate::Engine;

impl From<Error> for PyErr {
    fn from(err: Error) -> PyErr {
        PyValueError::new_err(format!("[{}] {}", err.code(), err))
    }
}

fn file_format(name: &str) -> Result<FileFormat, Error> {
    name.parse::<FileFormat>()
}

#[pyclass]
struct PyEngine {
    inner: Arc<Engine>,
}

#[pymethods]
impl PyEngine {
    #[new]
    fn new() -> Self {
        Self {
            inner: Arc::new(Engine::new()),
        }
    }

    fn input_timestamps(&self, timestamps: Vec<i64>, channels: Vec<u8>) -> PyResult<()> {
        Ok(self.inner.input_timestamps(&timestamps, &channels)?)
    }

    fn read_timestamps(&self, filename: &str, format: &str) -> PyResult<u64> {
        Ok(self.inner.read_timestamps(filename, file_format(format)?)?)
    }

    fn write_timestamps(&self, filename: &str, format: &str) -> PyResult<()> {
        Ok(self.inner.write_timestamps(filename, file_format(format)?)?)
    }

    fn generate_timestamps(&self, normal: bool, center: f64, width: f64, count: usize) -> PyResult<usize> {
        let params = SimParams {
            sim_type: if normal { SimType::Normal } else { SimType::Flat },
            center,
            width,
        };
        Ok(self.inner.generate_timestamps(params, count)?)
    }

    fn flush(&self) {
        self.inner.flush();
    }

    fn data_lost(&self) -> bool {
        self.inner.data_lost()
    }

    fn set_channel_delay(&self, channel: u8, delay: i32) -> PyResult<()> {
        Ok(self.inner.set_channel_delay(channel, delay)?)
    }

    fn enable_channels(&self, start: bool, mask: u32) {
        self.inner.enable_channels(start, mask);
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn freeze_buffers(&self, freeze: bool) {
        self.inner.freeze_buffers(freeze);
    }

    fn set_timestamp_buffer_size(&self, size: usize) -> PyResult<()> {
        Ok(self.inner.set_timestamp_buffer_size(size)?)
    }

    /// Returns (timestamps, channels) of the buffered events, oldest first.
    fn last_timestamps(&self, reset: bool) -> (Vec<i64>, Vec<u8>) {
        let snapshot = self.inner.last_timestamps(reset);
        (snapshot.timestamps(), snapshot.channels())
    }

    fn set_coincidence_params(&self, window_ps: i64, exposure_ms: u32) -> PyResult<()> {
        Ok(self.inner.set_coincidence_params(window_ps, exposure_ms)?)
    }

    /// Returns (counters, updates).
    fn coinc_counters(&self) -> (Vec<u32>, u32) {
        let snapshot = self.inner.coinc_counters();
        (snapshot.counters.to_vec(), snapshot.updates)
    }

    fn enable_histograms(&self, enable: bool) {
        self.inner.histograms().enable(enable);
    }

    fn set_histogram_params(&self, bin_width: i32, bin_count: usize) -> PyResult<()> {
        Ok(self.inner.histograms().set_params(bin_width, bin_count)?)
    }

    fn add_histogram(&self, start: u8, stop: u8) -> PyResult<()> {
        Ok(self.inner.histograms().add_histogram(start, stop)?)
    }

    /// Returns (bins, overflow).
    fn histogram(&self, start: u8, stop: u8, reset: bool) -> PyResult<(Vec<u32>, u32)> {
        let hist = self.inner.histograms().read(start, stop, reset)?;
        Ok((hist.bins, hist.overflow))
    }

    fn enable_hg2(&self, enable: bool) {
        self.inner.hg2().enable(enable);
    }

    fn set_hg2_params(&self, bin_width: i32, bin_count: usize) -> PyResult<()> {
        Ok(self.inner.hg2().set_params(bin_width, bin_count)?)
    }

    fn set_hg2_input(&self, idler: u8, signal1: u8, signal2: u8) -> PyResult<()> {
        Ok(self.inner.hg2().set_input(idler, signal1, signal2)?)
    }

    fn calc_hg2_g2(&self, reset: bool) -> PyResult<Vec<f64>> {
        Ok(self.inner.hg2().calc_g2(reset)?)
    }

    fn calc_hg2_tcp_1d(&self, reset: bool) -> PyResult<Vec<i64>> {
        Ok(self.inner.hg2().calc_tcp_1d(reset)?)
    }

    /// Returns (idler_events, coinc_events, hist_signal1_idler, hist_signal2_idler).
    fn hg2_raw(&self) -> PyResult<(i64, i64, Vec<i64>, Vec<i64>)> {
        let raw = self.inner.hg2().raw()?;
        Ok((
            raw.idler_events,
            raw.coinc_events,
            raw.hist_signal1_idler,
            raw.hist_signal2_idler,
        ))
    }
}

#[pymodule]
fn tdc_engine(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyEngine>()?;
    Ok(())
}
