//! Pixel-space windows

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bbox::BBox;
use crate::raster::GeoTransform;

/// Snap distance used when rounding fractional pixel edges, so that a box
/// edge computed as `2.0000000001` does not pull in an extra column.
const EDGE_EPSILON: f64 = 1e-9;

/// A pixel-space rectangle: row/col offset plus height and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub row_off: usize,
    pub col_off: usize,
    pub height: usize,
    pub width: usize,
}

impl PixelWindow {
    pub fn new(row_off: usize, col_off: usize, height: usize, width: usize) -> Self {
        Self {
            row_off,
            col_off,
            height,
            width,
        }
    }

    /// Window covering a whole `rows` x `cols` grid
    pub fn full(rows: usize, cols: usize) -> Self {
        Self::new(0, 0, rows, cols)
    }

    /// Exclusive end row
    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    /// Exclusive end column
    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.height * self.width
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row_off && row < self.row_end() && col >= self.col_off && col < self.col_end()
    }

    /// Whether `other` lies completely inside this window
    pub fn contains_window(&self, other: &PixelWindow) -> bool {
        other.row_off >= self.row_off
            && other.col_off >= self.col_off
            && other.row_end() <= self.row_end()
            && other.col_end() <= self.col_end()
    }

    /// Overlap of two windows, `None` when they share no pixel
    pub fn intersection(&self, other: &PixelWindow) -> Option<PixelWindow> {
        let row_off = self.row_off.max(other.row_off);
        let col_off = self.col_off.max(other.col_off);
        let row_end = self.row_end().min(other.row_end());
        let col_end = self.col_end().min(other.col_end());

        if row_off >= row_end || col_off >= col_end {
            return None;
        }
        Some(PixelWindow::new(row_off, col_off, row_end - row_off, col_end - col_off))
    }

    /// Smallest window covering both
    pub fn union(&self, other: &PixelWindow) -> PixelWindow {
        let row_off = self.row_off.min(other.row_off);
        let col_off = self.col_off.min(other.col_off);
        let row_end = self.row_end().max(other.row_end());
        let col_end = self.col_end().max(other.col_end());
        PixelWindow::new(row_off, col_off, row_end - row_off, col_end - col_off)
    }

    /// Clip to a `rows` x `cols` grid
    pub fn clip_to_grid(&self, rows: usize, cols: usize) -> Option<PixelWindow> {
        self.intersection(&PixelWindow::full(rows, cols))
    }

    /// Grow by `margin` pixels on every side, clipped to a `rows` x `cols` grid
    pub fn expanded(&self, margin: usize, rows: usize, cols: usize) -> PixelWindow {
        let row_off = self.row_off.saturating_sub(margin);
        let col_off = self.col_off.saturating_sub(margin);
        let row_end = (self.row_end() + margin).min(rows).max(row_off);
        let col_end = (self.col_end() + margin).min(cols).max(col_off);
        PixelWindow::new(row_off, col_off, row_end - row_off, col_end - col_off)
    }

    /// Centre pixel `(row, col)`
    pub fn center(&self) -> (usize, usize) {
        (
            self.row_off + self.height.saturating_sub(1) / 2,
            self.col_off + self.width.saturating_sub(1) / 2,
        )
    }

    /// Position of this window relative to the top-left pixel of `outer`.
    ///
    /// Returns `None` unless `outer` contains this window.
    pub fn offset_within(&self, outer: &PixelWindow) -> Option<(usize, usize)> {
        if !outer.contains_window(self) {
            return None;
        }
        Some((self.row_off - outer.row_off, self.col_off - outer.col_off))
    }

    /// Minimal aligned window covering a map-space box on the given grid,
    /// clipped to the `rows` x `cols` extent.
    ///
    /// Offsets are floored and far edges ceiled; a degenerate box (a point)
    /// still covers the one pixel that contains it. Returns `None` when the
    /// box does not touch the grid.
    pub fn covering(
        bbox: &BBox,
        transform: &GeoTransform,
        rows: usize,
        cols: usize,
    ) -> Option<PixelWindow> {
        let (min_col, min_row, max_col, max_row) = transform.bbox_to_pixel_extent(bbox);
        if !(min_col.is_finite() && min_row.is_finite() && max_col.is_finite() && max_row.is_finite()) {
            return None;
        }

        let (c0, c1) = snap_span(min_col, max_col);
        let (r0, r1) = snap_span(min_row, max_row);

        let r0 = r0.max(0);
        let c0 = c0.max(0);
        let r1 = r1.min(rows as i64);
        let c1 = c1.min(cols as i64);

        if r0 >= r1 || c0 >= c1 {
            return None;
        }

        Some(PixelWindow::new(
            r0 as usize,
            c0 as usize,
            (r1 - r0) as usize,
            (c1 - c0) as usize,
        ))
    }
}

/// Integer span `[start, end)` covering the fractional span `[lo, hi]`
fn snap_span(lo: f64, hi: f64) -> (i64, i64) {
    let start = snap(lo, f64::floor);
    let mut end = snap(hi, f64::ceil);
    if end <= start {
        end = start + 1;
    }
    (start, end)
}

fn snap(v: f64, round: fn(f64) -> f64) -> i64 {
    let nearest = v.round();
    if (v - nearest).abs() < EDGE_EPSILON {
        nearest as i64
    } else {
        round(v) as i64
    }
}

impl fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[rows {}..{}, cols {}..{}]",
            self.row_off,
            self.row_end(),
            self.col_off,
            self.col_end()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection_and_union() {
        let a = PixelWindow::new(0, 0, 10, 10);
        let b = PixelWindow::new(5, 8, 10, 10);
        assert_eq!(a.intersection(&b), Some(PixelWindow::new(5, 8, 5, 2)));
        assert_eq!(a.union(&b), PixelWindow::new(0, 0, 15, 18));

        let c = PixelWindow::new(10, 0, 3, 3);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_covering_aligned_box() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let w = PixelWindow::covering(&BBox::new(0.0, 8.0, 2.0, 10.0), &gt, 10, 10).unwrap();
        assert_eq!(w, PixelWindow::new(0, 0, 2, 2));
    }

    #[test]
    fn test_covering_fractional_box_expands_outwards() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let w = PixelWindow::covering(&BBox::new(1.5, 6.2, 3.1, 8.9), &gt, 10, 10).unwrap();
        assert_eq!(w, PixelWindow::new(1, 1, 3, 3));
    }

    #[test]
    fn test_covering_point_is_one_pixel() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let w = PixelWindow::covering(&BBox::new(3.4, 4.6, 3.4, 4.6), &gt, 10, 10).unwrap();
        assert_eq!(w, PixelWindow::new(5, 3, 1, 1));
    }

    #[test]
    fn test_covering_clips_and_rejects() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let w = PixelWindow::covering(&BBox::new(-5.0, 5.0, 2.0, 15.0), &gt, 10, 10).unwrap();
        assert_eq!(w, PixelWindow::new(0, 0, 5, 2));

        assert!(PixelWindow::covering(&BBox::new(20.0, 20.0, 30.0, 30.0), &gt, 10, 10).is_none());
    }

    #[test]
    fn test_expanded_clips_to_grid() {
        let w = PixelWindow::new(0, 3, 2, 2).expanded(1, 10, 5);
        assert_eq!(w, PixelWindow::new(0, 2, 3, 3));
    }

    #[test]
    fn test_offset_within() {
        let outer = PixelWindow::new(10, 10, 20, 20);
        assert_eq!(PixelWindow::new(12, 15, 2, 2).offset_within(&outer), Some((2, 5)));
        assert_eq!(PixelWindow::new(0, 15, 2, 2).offset_within(&outer), None);
    }
}
