//! Errors raised while describing or reading rasters

use thiserror::Error;

/// Error type for raster access and core type construction
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{len} samples do not fill {bands} band(s) of {width}x{height}")]
    InvalidDimensions {
        len: usize,
        bands: usize,
        width: usize,
        height: usize,
    },

    #[error("read window {window} exceeds the {rows}x{cols} grid")]
    WindowOutsideGrid {
        window: String,
        rows: usize,
        cols: usize,
    },

    #[error("band {band} requested from a {count}-band raster")]
    BandOutOfRange { band: usize, count: usize },

    #[error("unsupported pixel layout: {0}")]
    UnsupportedDataType(String),

    #[error("TIFF decoding failed: {0}")]
    Tiff(String),

    #[error("invalid {name} '{value}': {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl From<tiff::TiffError> for Error {
    fn from(e: tiff::TiffError) -> Self {
        Error::Tiff(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
