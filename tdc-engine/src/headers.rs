use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Timestamp file formats. The discriminants are the codes stored in file headers.
#[derive(FromPrimitive, ToPrimitive, Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileFormat {
    /// Two comma separated decimal columns: time [ps], channel
    Ascii = 0,
    /// 40 byte header, 10 byte records
    Binary = 1,
    /// 40 byte header, 5 byte records; stop channels 1..8 only
    Compressed = 2,
    /// Like `Binary` without the header
    Raw = 3,
    /// No format; stops writing
    None = 4,
}

impl FileFormat {
    pub fn has_header(self) -> bool {
        matches!(self, FileFormat::Binary | FileFormat::Compressed)
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" | "txt" => Ok(FileFormat::Ascii),
            "binary" | "bin" => Ok(FileFormat::Binary),
            "compressed" => Ok(FileFormat::Compressed),
            "raw" => Ok(FileFormat::Raw),
            "none" => Ok(FileFormat::None),
            _ => Err(Error::InvalidParameter(format!("unknown file format {}", s))),
        }
    }
}

/// Class of the device the configuration belongs to.
#[derive(FromPrimitive, ToPrimitive, Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceClass {
    /// Multichannel device, delays limited to ±50 ns
    Mc = 0,
    /// High resolution device, delays limited to ±100 ns
    Hr = 1,
    /// No device; synthetic and replayed data only
    Simulated = 2,
}

impl DeviceClass {
    /// Largest absolute channel delay in ps the device can compensate.
    pub fn max_delay_ps(self) -> i32 {
        match self {
            DeviceClass::Mc => 50_000,
            DeviceClass::Hr | DeviceClass::Simulated => 100_000,
        }
    }
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass::Simulated
    }
}

/// Set of device features, as stored in binary file headers.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags(pub u32);

impl FeatureFlags {
    /// Cross correlation (HBT) functions
    pub const HBT: u32 = 0x0001;
    /// Lifetime functions
    pub const LIFETIME: u32 = 0x0002;
    /// Marker inputs
    pub const MARKERS: u32 = 0x0020;
    /// Event filters for the timestamp stream
    pub const FILTERS: u32 = 0x0040;
    /// External clock
    pub const EXTCLK: u32 = 0x0080;
    /// Synchronisation of multiple devices
    pub const DEVSYNC: u32 = 0x0100;

    const NAMES: [(u32, &'static str); 6] = [
        (Self::HBT, "HBT"),
        (Self::LIFETIME, "LIFETIME"),
        (Self::MARKERS, "MARKERS"),
        (Self::FILTERS, "FILTERS"),
        (Self::EXTCLK, "EXTCLK"),
        (Self::DEVSYNC, "DEVSYNC"),
    ];

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}
