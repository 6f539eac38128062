//! Affine georeferencing of a pixel grid

use serde::{Deserialize, Serialize};

use crate::bbox::BBox;
use crate::raster::PixelWindow;

/// Affine map from pixel space `(col, row)` to map space `(x, y)`:
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
///
/// Pixel `(col, row)` spans `[col, col + 1) x [row, row + 1)` in pixel
/// space; its centre sits at `(col + 0.5, row + 0.5)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Negative for north-up grids
    pub pixel_height: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
}

impl GeoTransform {
    /// North-up grid without rotation
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    /// From coefficients in GDAL order
    /// `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`
    pub fn from_gdal(c: [f64; 6]) -> Self {
        let [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height] = c;
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation,
            col_rotation,
        }
    }

    fn map(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Map coordinates of a pixel centre
    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        self.map(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Map coordinates of a pixel's upper-left corner
    pub fn pixel_to_geo_corner(&self, col: usize, row: usize) -> (f64, f64) {
        self.map(col as f64, row as f64)
    }

    /// Fractional pixel position `(col, row)` of a map point; NaN for a
    /// singular transform. The containing pixel is the floor of each value.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.determinant();
        if det.abs() < 1e-12 {
            return (f64::NAN, f64::NAN);
        }
        let (dx, dy) = (x - self.origin_x, y - self.origin_y);
        (
            (self.pixel_height * dx - self.row_rotation * dy) / det,
            (self.pixel_width * dy - self.col_rotation * dx) / det,
        )
    }

    fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation
    }

    /// Ground area of one pixel. The finest grid has the smallest area.
    pub fn pixel_area(&self) -> f64 {
        self.determinant().abs()
    }

    /// Map-space box of a pixel window; for rotated grids the box encloses
    /// all four window corners.
    pub fn window_bounds(&self, window: &PixelWindow) -> BBox {
        let (c0, r0) = (window.col_off as f64, window.row_off as f64);
        let (c1, r1) = (window.col_end() as f64, window.row_end() as f64);
        enclose([self.map(c0, r0), self.map(c1, r0), self.map(c0, r1), self.map(c1, r1)])
    }

    /// Map-space box of a whole `width` x `height` grid
    pub fn grid_bounds(&self, width: usize, height: usize) -> BBox {
        self.window_bounds(&PixelWindow::full(height, width))
    }

    /// Fractional pixel extent `(min_col, min_row, max_col, max_row)` of a
    /// map-space box
    pub fn bbox_to_pixel_extent(&self, bbox: &BBox) -> (f64, f64, f64, f64) {
        let pixels = enclose([
            self.geo_to_pixel(bbox.min_x, bbox.min_y),
            self.geo_to_pixel(bbox.min_x, bbox.max_y),
            self.geo_to_pixel(bbox.max_x, bbox.min_y),
            self.geo_to_pixel(bbox.max_x, bbox.max_y),
        ]);
        (pixels.min_x, pixels.min_y, pixels.max_x, pixels.max_y)
    }
}

fn enclose(points: [(f64, f64); 4]) -> BBox {
    let (x0, y0) = points[0];
    points[1..].iter().fold(BBox::new(x0, y0, x0, y0), |b, &(x, y)| {
        BBox::new(b.min_x.min(x), b.min_y.min(y), b.max_x.max(x), b.max_y.max(y))
    })
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, -1.0)
    }
}
