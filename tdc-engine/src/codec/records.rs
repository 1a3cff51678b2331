//! Record layouts of the timestamp file formats.
//!
//! Every layout is an explicit encode/decode pair over byte buffers:
//!
//! * BINARY / RAW, 10 bytes: `i64` LE time in ps, `u16` LE channel code.
//!   Stop channel `n` is stored as `n - 1`, the start channel as `0xFFFF`,
//!   marker channels unchanged.
//! * COMPRESSED, 5 bytes: a little endian 40 bit word, bits 0..=36 hold the time
//!   modulo 2^37 ps, bits 37..=39 the stop channel index 0..=7 (channels 1..=8).
//! * ASCII: `"<time>,<channel>\n"` with the channel numbering of [`Event`].
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::headers::FileFormat;
use crate::{Event, START_CHANNEL, TDC_CHANNELS};

pub const BINARY_RECORD_BYTES: usize = 10;
pub const COMPRESSED_RECORD_BYTES: usize = 5;
pub const COMPRESSED_TIME_BITS: u32 = 37;
/// Period of the compressed time counter, about 137 ms at 1 ps resolution
pub const COMPRESSED_PERIOD: i64 = 1 << COMPRESSED_TIME_BITS;
const COMPRESSED_TIME_MASK: u64 = (1 << COMPRESSED_TIME_BITS) - 1;
const COMPRESSED_CHANNELS: u8 = 8;
const START_CODE: u16 = 0xFFFF;

#[inline]
pub fn channel_to_code(channel: u8) -> u16 {
    if channel == START_CHANNEL {
        START_CODE
    } else if channel <= TDC_CHANNELS {
        (channel - 1) as u16
    } else {
        channel as u16
    }
}

#[inline]
pub fn code_to_channel(code: u16) -> Option<u8> {
    match code {
        START_CODE => Some(START_CHANNEL),
        c if c < TDC_CHANNELS as u16 => Some(c as u8 + 1),
        c if c <= u8::MAX as u16 => Some(c as u8),
        _ => None,
    }
}

#[inline]
pub fn encode_binary(event: &Event, buf: &mut [u8]) {
    LittleEndian::write_i64(&mut buf[0..8], event.time);
    LittleEndian::write_u16(&mut buf[8..10], channel_to_code(event.channel));
}

/// `None` for channel codes that do not map to an input.
#[inline]
pub fn decode_binary(buf: &[u8]) -> Option<Event> {
    let time = LittleEndian::read_i64(&buf[0..8]);
    let channel = code_to_channel(LittleEndian::read_u16(&buf[8..10]))?;
    Some(Event::new(time, channel))
}

/// Returns `false`, leaving `buf` untouched, when the event has no compressed
/// representation (start, markers and stop channels above 8).
#[inline]
pub fn encode_compressed(event: &Event, buf: &mut [u8]) -> bool {
    if event.channel < 1 || event.channel > COMPRESSED_CHANNELS {
        return false;
    }
    let time = event.time.rem_euclid(COMPRESSED_PERIOD) as u64;
    let packed = time | (((event.channel - 1) as u64) << COMPRESSED_TIME_BITS);
    LittleEndian::write_uint(&mut buf[..COMPRESSED_RECORD_BYTES], packed, COMPRESSED_RECORD_BYTES);
    true
}

/// Time modulo 2^37 and stop channel of a compressed record.
#[inline]
pub fn decode_compressed(buf: &[u8]) -> (u64, u8) {
    let packed = LittleEndian::read_uint(&buf[..COMPRESSED_RECORD_BYTES], COMPRESSED_RECORD_BYTES);
    let time = packed & COMPRESSED_TIME_MASK;
    let channel = (packed >> COMPRESSED_TIME_BITS) as u8 + 1;
    (time, channel)
}

pub fn write_ascii<W: Write>(writer: &mut W, event: &Event) -> std::io::Result<()> {
    writeln!(writer, "{},{}", event.time, event.channel)
}

/// Outcome of [`encode_events`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    pub records: usize,
    /// Time of the first event that made it into a record
    pub first_time: Option<i64>,
}

/// Appends the records of `events` to `out`.
pub fn encode_events(format: FileFormat, events: &[Event], out: &mut Vec<u8>) -> Encoded {
    let all = |events: &[Event]| Encoded {
        records: events.len(),
        first_time: events.first().map(|e| e.time),
    };
    match format {
        FileFormat::Binary | FileFormat::Raw => {
            let start = out.len();
            out.resize(start + events.len() * BINARY_RECORD_BYTES, 0);
            for (event, record) in events
                .iter()
                .zip(out[start..].chunks_exact_mut(BINARY_RECORD_BYTES))
            {
                encode_binary(event, record);
            }
            all(events)
        }
        FileFormat::Compressed => {
            let mut record = [0u8; COMPRESSED_RECORD_BYTES];
            let mut encoded = Encoded::default();
            for event in events {
                if encode_compressed(event, &mut record) {
                    out.extend_from_slice(&record);
                    encoded.records += 1;
                    encoded.first_time.get_or_insert(event.time);
                }
            }
            encoded
        }
        FileFormat::Ascii => {
            for event in events {
                // writing into a Vec cannot fail
                let _ = write_ascii(out, event);
            }
            all(events)
        }
        FileFormat::None => Encoded::default(),
    }
}
