//! The windowed-read contract between the engine and raster storage

use ndarray::Array3;

use crate::bbox::BBox;
use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{DataType, GeoTransform, PixelWindow};

/// Static description of a raster dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMetadata {
    /// Grid width in pixels
    pub width: usize,
    /// Grid height in pixels
    pub height: usize,
    pub band_count: usize,
    pub transform: GeoTransform,
    pub crs: Option<CRS>,
    /// Declared nodata value per band
    pub nodata: Vec<Option<f64>>,
    pub data_type: DataType,
    /// Band descriptions (e.g. `"NIR 850nm"`) when the file carries them
    pub band_descriptions: Vec<Option<String>>,
}

impl RasterMetadata {
    /// Metadata with no CRS, no nodata and no band descriptions
    pub fn new(
        width: usize,
        height: usize,
        band_count: usize,
        transform: GeoTransform,
        data_type: DataType,
    ) -> Self {
        Self {
            width,
            height,
            band_count,
            transform,
            crs: None,
            nodata: vec![None; band_count],
            data_type,
            band_descriptions: vec![None; band_count],
        }
    }

    /// Nodata value declared for a band (0-based)
    pub fn nodata_for(&self, band: usize) -> Option<f64> {
        self.nodata.get(band).copied().flatten()
    }

    /// Window covering the full pixel grid
    pub fn grid_window(&self) -> PixelWindow {
        PixelWindow::full(self.height, self.width)
    }

    /// Map-space extent of the grid
    pub fn extent(&self) -> BBox {
        self.transform.grid_bounds(self.width, self.height)
    }

    /// Validate a read request against this grid
    pub fn check_request(&self, window: &PixelWindow, bands: &[usize]) -> Result<()> {
        if window.is_empty() || !self.grid_window().contains_window(window) {
            return Err(Error::WindowOutsideGrid {
                window: window.to_string(),
                rows: self.height,
                cols: self.width,
            });
        }
        if let Some(&band) = bands.iter().find(|&&b| b >= self.band_count) {
            return Err(Error::BandOutOfRange {
                band,
                count: self.band_count,
            });
        }
        Ok(())
    }
}

/// A raster dataset that supports windowed reads.
///
/// Implementations must be safe for concurrent reads from several worker
/// threads: no shared mutable cursor, no caching of full-raster pixel data.
pub trait RasterAccess: Send + Sync {
    /// Grid, band and nodata description
    fn metadata(&self) -> &RasterMetadata;

    /// Read `bands` (0-based) inside `window`.
    ///
    /// Returns a band-major array of shape `(bands.len(), window.height,
    /// window.width)`. The window must lie inside the grid.
    fn read_window(&self, window: &PixelWindow, bands: &[usize]) -> Result<Array3<f64>>;
}
