use byteorder::{ByteOrder, LittleEndian};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::errors::Error;
use crate::headers::{DeviceClass, FeatureFlags, FileFormat};

pub const HEADER_BYTES: usize = 40;
pub const MAGIC: &[u8; 8] = b"TDCSTAMP";
pub const CURRENT_VERSION: u16 = 1;
/// Time base of the stored timestamps in fs
pub const DEFAULT_TIMEBASE_FS: u32 = 1_000;
/// Byte offset of the first timestamp field, patched once the first record is known
pub(crate) const FIRST_TIMESTAMP_OFFSET: u64 = 24;

/// Fixed size header in front of BINARY and COMPRESSED files.
///
/// Layout, all fields little endian:
///
/// | bytes  | field                 |
/// |--------|-----------------------|
/// | 0..8   | magic `TDCSTAMP`      |
/// | 8..10  | version `u16`         |
/// | 10..12 | format code `u16`     |
/// | 12..16 | feature flags `u32`   |
/// | 16..18 | device class `u16`    |
/// | 18..20 | reserved              |
/// | 20..24 | time base in fs `u32` |
/// | 24..32 | first timestamp `i64` |
/// | 32..40 | reserved              |
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u16,
    pub format: FileFormat,
    pub features: FeatureFlags,
    pub device_class: DeviceClass,
    pub timebase_fs: u32,
    pub first_timestamp: i64,
}

impl StreamHeader {
    pub fn new(format: FileFormat, features: FeatureFlags, device_class: DeviceClass) -> Self {
        Self {
            version: CURRENT_VERSION,
            format,
            features,
            device_class,
            timebase_fs: DEFAULT_TIMEBASE_FS,
            first_timestamp: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], self.version);
        LittleEndian::write_u16(&mut buf[10..12], self.format.to_u16().unwrap_or(0));
        LittleEndian::write_u32(&mut buf[12..16], self.features.0);
        LittleEndian::write_u16(&mut buf[16..18], self.device_class.to_u16().unwrap_or(0));
        LittleEndian::write_u32(&mut buf[20..24], self.timebase_fs);
        LittleEndian::write_i64(&mut buf[24..32], self.first_timestamp);
        buf
    }

    /// Parses a header from the start of a file.
    ///
    /// Returns `Ok(None)` if the bytes do not start with a header at all, which
    /// is the case for RAW files. A header with a newer version is `Unsupported`,
    /// one with nonsensical fields an `InvalidHeader`.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, Error> {
        if buf.len() < HEADER_BYTES || &buf[0..8] != MAGIC {
            return Ok(None);
        }

        let version = LittleEndian::read_u16(&buf[8..10]);
        if version == 0 {
            return Err(Error::InvalidHeader(String::from("Header version 0")));
        }
        if version > CURRENT_VERSION {
            return Err(Error::Unsupported(format!("header version {}", version)));
        }

        let format_code = LittleEndian::read_u16(&buf[10..12]);
        let format = FileFormat::from_u16(format_code)
            .filter(|f| f.has_header())
            .ok_or_else(|| {
                Error::InvalidHeader(format!("Invalid format code {} in header", format_code))
            })?;

        let class_code = LittleEndian::read_u16(&buf[16..18]);
        let device_class = DeviceClass::from_u16(class_code).ok_or_else(|| {
            Error::InvalidHeader(format!("Invalid device class {} in header", class_code))
        })?;

        Ok(Some(Self {
            version,
            format,
            features: FeatureFlags(LittleEndian::read_u32(&buf[12..16])),
            device_class,
            timebase_fs: LittleEndian::read_u32(&buf[20..24]),
            first_timestamp: LittleEndian::read_i64(&buf[24..32]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamHeader {
        let mut header = StreamHeader::new(
            FileFormat::Compressed,
            FeatureFlags(FeatureFlags::HBT | FeatureFlags::LIFETIME),
            DeviceClass::Hr,
        );
        header.first_timestamp = -42;
        header
    }

    #[test]
    fn layout() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..8], b"TDCSTAMP");
        assert_eq!(&bytes[8..10], &[1, 0]);
        assert_eq!(&bytes[10..12], &[2, 0]);
        assert_eq!(&bytes[12..16], &[3, 0, 0, 0]);
        assert_eq!(&bytes[16..18], &[1, 0]);
        assert_eq!(&bytes[20..24], &1_000u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &(-42i64).to_le_bytes());
        assert!(bytes[32..40].iter().all(|&b| b == 0));
        assert_eq!(StreamHeader::parse(&bytes).unwrap(), Some(sample()));
    }

    #[test]
    fn missing_header() {
        assert_eq!(StreamHeader::parse(&[0u8; 40]).unwrap(), None);
        assert_eq!(StreamHeader::parse(b"TDCSTAMP").unwrap(), None);
    }

    #[test]
    fn rejects_bad_headers() {
        let mut bytes = sample().to_bytes();
        bytes[8] = 9;
        assert!(matches!(StreamHeader::parse(&bytes), Err(Error::Unsupported(_))));

        let mut bytes = sample().to_bytes();
        bytes[10] = FileFormat::Ascii as u8;
        assert!(matches!(StreamHeader::parse(&bytes), Err(Error::InvalidHeader(_))));

        let mut bytes = sample().to_bytes();
        bytes[16] = 17;
        assert!(matches!(StreamHeader::parse(&bytes), Err(Error::InvalidHeader(_))));
    }
}
