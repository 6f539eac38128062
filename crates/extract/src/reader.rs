//! Windowed reads and validity masks
//!
//! The reader clips every request to the source grid, reads the selected
//! bands through [`RasterAccess`](phytostat_core::RasterAccess) and turns
//! declared nodata, NaN and the optional threshold into a per-pixel mask.
//! Nothing is cached between reads.

use geo::Intersects;
use geo_types::{Geometry, LineString, Point, Polygon};
use ndarray::{s, Array2, Array3, Axis, Zip};
use phytostat_core::{GeoTransform, PixelWindow};
use tracing::debug;

use crate::error::{ExtractError, Result};
use crate::fusion::RegisteredSource;

/// Relative tolerance when matching float pixels against a nodata value
const NODATA_RTOL: f64 = 1e-6;

/// Windows this narrow or shorter include every touched pixel
const ALL_TOUCHED_MAX_SIDE: usize = 2;

/// Pixels of one window: band-major values plus a validity mask.
///
/// `window` is expressed on the grid of the source the pixels came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBlock {
    pub window: PixelWindow,
    /// Shape `(bands, window.height, window.width)`
    pub data: Array3<f64>,
    /// Shape `(window.height, window.width)`
    pub valid: Array2<bool>,
}

impl PixelBlock {
    pub fn new(window: PixelWindow, data: Array3<f64>, valid: Array2<bool>) -> Self {
        Self {
            window,
            data,
            valid,
        }
    }

    pub fn band_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Validity at absolute grid coordinates; pixels outside the block are
    /// invalid
    pub fn is_valid(&self, row: i64, col: i64) -> bool {
        self.local(row, col)
            .is_some_and(|(r, c)| self.valid[[r, c]])
    }

    /// Band value at absolute grid coordinates
    pub fn value(&self, band: usize, row: i64, col: i64) -> Option<f64> {
        self.local(row, col).map(|(r, c)| self.data[[band, r, c]])
    }

    fn local(&self, row: i64, col: i64) -> Option<(usize, usize)> {
        if row < 0 || col < 0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        self.window
            .contains(row, col)
            .then(|| (row - self.window.row_off, col - self.window.col_off))
    }

    /// Copy of the part of this block inside `window`
    pub fn crop(&self, window: &PixelWindow) -> Option<PixelBlock> {
        let (r, c) = window.offset_within(&self.window)?;
        let rows = r..r + window.height;
        let cols = c..c + window.width;
        Some(PixelBlock {
            window: *window,
            data: self.data.slice(s![.., rows.clone(), cols.clone()]).to_owned(),
            valid: self.valid.slice(s![rows, cols]).to_owned(),
        })
    }

    /// Keep only the pixels covered by `geometry`.
    ///
    /// `transform` is the transform of the full grid `window` refers to.
    pub fn restrict_to_geometry(&mut self, geometry: &Geometry<f64>, transform: &GeoTransform) {
        let mask = rasterize(geometry, transform, &self.window);
        self.valid.zip_mut_with(&mask, |v, &inside| *v = *v && inside);
    }
}

/// Reads windows from one registered source.
pub struct WindowedReader<'a> {
    source: &'a RegisteredSource,
    threshold: Option<f64>,
}

impl<'a> WindowedReader<'a> {
    pub fn new(source: &'a RegisteredSource, threshold: Option<f64>) -> Self {
        Self { source, threshold }
    }

    /// Read the selected bands inside `window`.
    ///
    /// The window is clipped to the source grid first; `Ok(None)` means it
    /// does not overlap the grid at all.
    pub fn read(&self, window: &PixelWindow) -> Result<Option<PixelBlock>> {
        let meta = self.source.metadata();
        let Some(clipped) = window.clip_to_grid(meta.height, meta.width) else {
            return Ok(None);
        };

        let data = self
            .source
            .access()
            .read_window(&clipped, self.source.bands())
            .map_err(|e| ExtractError::RasterIo {
                source_name: self.source.name().to_string(),
                window: clipped.to_string(),
                reason: e.to_string(),
            })?;

        let nodata: Vec<Option<f64>> = self
            .source
            .bands()
            .iter()
            .map(|&b| meta.nodata_for(b))
            .collect();
        let valid = validity_mask(&data, &nodata, meta.data_type.is_float(), self.threshold);

        debug!(
            "read {} from '{}': {} of {} pixels valid",
            clipped,
            self.source.name(),
            valid.iter().filter(|&&v| v).count(),
            clipped.pixel_count()
        );

        Ok(Some(PixelBlock::new(clipped, data, valid)))
    }
}

/// A pixel is valid when no band is NaN or nodata and, with a threshold,
/// every band is strictly greater than it.
fn validity_mask(
    data: &Array3<f64>,
    nodata: &[Option<f64>],
    float: bool,
    threshold: Option<f64>,
) -> Array2<bool> {
    let (_, rows, cols) = data.dim();
    let mut valid = Array2::from_elem((rows, cols), true);

    for (band, nd) in data.axis_iter(Axis(0)).zip(nodata) {
        Zip::from(&mut valid).and(&band).for_each(|ok, &v| {
            if !*ok {
                return;
            }
            let is_nodata = nd.is_some_and(|nd| matches_nodata(v, nd, float));
            let below = threshold.is_some_and(|t| v <= t);
            *ok = !(v.is_nan() || is_nodata || below);
        });
    }
    valid
}

fn matches_nodata(value: f64, nodata: f64, float: bool) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else if float {
        (value - nodata).abs() <= NODATA_RTOL * nodata.abs().max(1.0)
    } else {
        value == nodata
    }
}

/// Burn a geometry onto `window` of the grid described by `transform`.
///
/// Pixels whose centre intersects the geometry are selected. Windows at most
/// two pixels wide or tall select every touched pixel instead, and so does a
/// geometry whose centre pass selects nothing (thin or tiny polygons, points).
pub fn rasterize(
    geometry: &Geometry<f64>,
    transform: &GeoTransform,
    window: &PixelWindow,
) -> Array2<bool> {
    let all_touched =
        window.width <= ALL_TOUCHED_MAX_SIDE || window.height <= ALL_TOUCHED_MAX_SIDE;
    let mask = burn(geometry, transform, window, all_touched);
    if all_touched || mask.iter().any(|&v| v) {
        mask
    } else {
        burn(geometry, transform, window, true)
    }
}

fn burn(
    geometry: &Geometry<f64>,
    transform: &GeoTransform,
    window: &PixelWindow,
    all_touched: bool,
) -> Array2<bool> {
    Array2::from_shape_fn((window.height, window.width), |(r, c)| {
        let row = window.row_off + r;
        let col = window.col_off + c;
        if all_touched {
            geometry.intersects(&pixel_polygon(transform, row, col))
        } else {
            let (x, y) = transform.pixel_to_geo(col, row);
            geometry.intersects(&Point::new(x, y))
        }
    })
}

fn pixel_polygon(transform: &GeoTransform, row: usize, col: usize) -> Polygon<f64> {
    let corners = [
        transform.pixel_to_geo_corner(col, row),
        transform.pixel_to_geo_corner(col + 1, row),
        transform.pixel_to_geo_corner(col + 1, row + 1),
        transform.pixel_to_geo_corner(col, row + 1),
    ];
    Polygon::new(LineString::from(corners.to_vec()), vec![])
}
