pub mod header;
pub mod records;
pub mod streamers;
pub mod writer;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::errors::Error;
use crate::headers::{FeatureFlags, FileFormat};
use crate::source::EventSource;
use crate::Event;

pub use header::{StreamHeader, HEADER_BYTES};
pub use writer::StreamWriter;
use streamers::{BinaryStream, CompressedStream};

/// Events per batch handed out by [`TimestampReader::next_batch`]
pub const REPLAY_BATCH: usize = 4096;

enum RecordReader {
    Binary(BinaryStream),
    Compressed(CompressedStream),
}

/// Reader over a timestamp file, produced by [`open`].
pub struct TimestampReader {
    header: Option<StreamHeader>,
    format: FileFormat,
    records: RecordReader,
}

impl TimestampReader {
    /// Format the records are decoded with; from the header if there is one.
    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Feature flags stored in the header, if any.
    pub fn features(&self) -> Option<FeatureFlags> {
        self.header.map(|h| h.features)
    }

    /// Records that were read but did not decode into an event.
    pub fn skipped_records(&self) -> usize {
        match &self.records {
            RecordReader::Binary(s) => s.skipped_records(),
            RecordReader::Compressed(s) => s.skipped_records(),
        }
    }
}

impl Iterator for TimestampReader {
    type Item = Event;

    #[inline]
    fn next(&mut self) -> Option<Event> {
        match &mut self.records {
            RecordReader::Binary(s) => s.next(),
            RecordReader::Compressed(s) => s.next(),
        }
    }
}

impl EventSource for TimestampReader {
    fn next_batch(&mut self) -> Option<Vec<Event>> {
        let batch: Vec<Event> = self.by_ref().take(REPLAY_BATCH).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }
}

/// Opens a timestamp file for reading.
///
/// A recognisable header decides the format and overrides `hint`. Without one
/// the hint is used and must name a binary layout: `Ascii` files cannot be
/// read back and `None` is not a format.
pub fn open<P: AsRef<Path>>(path: P, hint: FileFormat) -> Result<TimestampReader, Error> {
    let path = path.as_ref();
    let mut file = File::open(path)?;

    let mut start = Vec::with_capacity(HEADER_BYTES);
    (&mut file).take(HEADER_BYTES as u64).read_to_end(&mut start)?;

    let header = StreamHeader::parse(&start)?;
    let (format, offset) = match header {
        Some(h) => (h.format, HEADER_BYTES as u64),
        None => match hint {
            FileFormat::Binary | FileFormat::Raw => (FileFormat::Raw, 0),
            FileFormat::Compressed => (FileFormat::Compressed, 0),
            FileFormat::Ascii => {
                return Err(Error::Unsupported(String::from(
                    "reading ASCII timestamp files",
                )))
            }
            FileFormat::None => {
                return Err(Error::InvalidParameter(String::from(
                    "a file format is required for files without header",
                )))
            }
        },
    };

    let records = match format {
        FileFormat::Compressed => {
            let first = header.map_or(0, |h| h.first_timestamp);
            RecordReader::Compressed(CompressedStream::new(file, offset)?.with_time_base(first))
        }
        _ => RecordReader::Binary(BinaryStream::new(file, offset)?),
    };

    info!(
        "reading {:?} timestamps from {}{}",
        format,
        path.display(),
        if header.is_some() { "" } else { " (no header)" }
    );
    Ok(TimestampReader {
        header,
        format,
        records,
    })
}
