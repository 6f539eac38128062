//! In-memory multi-band raster

use ndarray::{s, Array3};

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, PixelWindow, RasterAccess, RasterElement, RasterMetadata};

/// A georeferenced band-major raster held in memory.
///
/// `MemoryRaster<T>` stores values of type `T` with shape `(bands, rows,
/// cols)`. It is the raster collaborator used for already-decoded data and in
/// tests; windowed reads copy only the requested rectangle.
///
/// # Example
///
/// ```
/// use ndarray::Array3;
/// use phytostat_core::{GeoTransform, MemoryRaster, PixelWindow, RasterAccess};
///
/// let data = Array3::<u16>::from_elem((3, 100, 100), 42);
/// let raster = MemoryRaster::new(data, GeoTransform::new(0.0, 100.0, 1.0, -1.0))
///     .with_nodata(Some(0.0));
///
/// let block = raster.read_window(&PixelWindow::new(10, 10, 5, 5), &[0, 2]).unwrap();
/// assert_eq!(block.dim(), (2, 5, 5));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryRaster<T: RasterElement> {
    data: Array3<T>,
    metadata: RasterMetadata,
}

impl<T: RasterElement> MemoryRaster<T> {
    /// Wrap a `(bands, rows, cols)` array
    pub fn new(data: Array3<T>, transform: GeoTransform) -> Self {
        let (bands, rows, cols) = data.dim();
        Self {
            data,
            metadata: RasterMetadata::new(cols, rows, bands, transform, T::DATA_TYPE),
        }
    }

    /// Build from a flat band-major vector
    pub fn from_vec(
        data: Vec<T>,
        bands: usize,
        rows: usize,
        cols: usize,
        transform: GeoTransform,
    ) -> Result<Self> {
        if data.len() != bands * rows * cols {
            return Err(Error::InvalidDimensions {
                len: data.len(),
                bands,
                width: cols,
                height: rows,
            });
        }
        let array = Array3::from_shape_vec((bands, rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(Self::new(array, transform))
    }

    pub fn with_crs(mut self, crs: CRS) -> Self {
        self.metadata.crs = Some(crs);
        self
    }

    /// Same nodata value for every band
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.metadata.nodata = vec![nodata; self.metadata.band_count];
        self
    }

    /// Per-band nodata values; missing entries mean "no nodata"
    pub fn with_band_nodata(mut self, nodata: Vec<Option<f64>>) -> Self {
        let count = self.metadata.band_count;
        self.metadata.nodata = (0..count)
            .map(|b| nodata.get(b).copied().flatten())
            .collect();
        self
    }

    pub fn with_band_descriptions<S: Into<String>>(mut self, names: Vec<S>) -> Self {
        let mut names = names.into_iter();
        self.metadata.band_descriptions = (0..self.metadata.band_count)
            .map(|_| names.next().map(Into::into))
            .collect();
        self
    }

    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    /// Dimensions as (bands, rows, cols)
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }
}

impl<T: RasterElement> RasterAccess for MemoryRaster<T> {
    fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    fn read_window(&self, window: &PixelWindow, bands: &[usize]) -> Result<Array3<f64>> {
        self.metadata.check_request(window, bands)?;

        let mut out = Array3::<f64>::zeros((bands.len(), window.height, window.width));
        for (i, &band) in bands.iter().enumerate() {
            let src = self.data.slice(s![
                band,
                window.row_off..window.row_end(),
                window.col_off..window.col_end()
            ]);
            out.slice_mut(s![i, .., ..])
                .zip_mut_with(&src, |o, &v| *o = v.as_f64());
        }
        Ok(out)
    }
}
