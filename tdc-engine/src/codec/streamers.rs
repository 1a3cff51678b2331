use std::io::{BufReader, Read, Seek, SeekFrom};

use tracing::{debug, warn};

use crate::codec::records::{self, COMPRESSED_PERIOD};
use crate::errors::Error;
use crate::{Event, RecordStream};

use tdc_engine_proc_macros::make_record_stream;

/// Number of records read from disk in one go
pub(crate) const BUFFER_RECORDS: usize = 1024 * 16;

// - - - - - - - - - - - - //
// BINARY / RAW Record Stream //
// - - - - - - - - - - - - //
#[make_record_stream(Binary, 10)]
fn parse_record(&mut self, record: &[u8]) -> Option<Event> {
    records::decode_binary(record)
}

// - - - - - - - - - - - - - //
// COMPRESSED Record Stream //
// - - - - - - - - - - - - - //
#[make_record_stream(Compressed, 5)]
fn parse_record(&mut self, record: &[u8]) -> Option<Event> {
    let (raw_time, channel) = records::decode_compressed(record);

    // the 37 bit counter went around
    if raw_time < self.last_raw_time {
        self.overflow_correction += COMPRESSED_PERIOD;
    }
    self.last_raw_time = raw_time;

    Some(Event::new(self.overflow_correction + raw_time as i64, channel))
}

impl CompressedStream {
    /// Starts the rollover unwrapping in the counter period of `first_timestamp`,
    /// so that absolute times survive a round trip.
    pub(crate) fn with_time_base(mut self, first_timestamp: i64) -> Self {
        self.overflow_correction = first_timestamp - first_timestamp.rem_euclid(COMPRESSED_PERIOD);
        self
    }
}
