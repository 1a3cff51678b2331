use std::io;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{0} is not enabled.")]
    NotEnabled(String),
    #[error("No event source attached.")]
    NoDataSource,
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("IO error.")]
    IOError(#[from] io::Error),
    #[error("{0}")]
    InvalidHeader(String),
}

impl Error {
    /// Numeric return code, 0 being reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidParameter(_) => 2,
            Error::NotEnabled(_) => 3,
            Error::NoDataSource => 4,
            Error::Unsupported(_) => 5,
            Error::IOError(_) => 6,
            Error::InvalidHeader(_) => 7,
        }
    }
}

/// Human readable message for a return code.
pub fn error_message(code: i32) -> &'static str {
    match code {
        0 => "Success",
        2 => "Invalid parameter",
        3 => "Function not enabled",
        4 => "No event source",
        5 => "Feature not supported",
        6 => "File could not be accessed",
        7 => "Invalid file header",
        _ => "Unknown error",
    }
}

pub(crate) fn check_range<T>(what: &str, value: T, min: T, max: T) -> Result<T, Error>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        Err(Error::InvalidParameter(format!(
            "{} = {} outside {} ... {}",
            what, value, min, max
        )))
    } else {
        Ok(value)
    }
}
