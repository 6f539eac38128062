//! Square tile partition of a pixel grid

use phytostat_core::PixelWindow;

/// One cell of a [`TileGrid`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row-major position in the grid
    pub index: usize,
    /// Pixels covered, cropped at the right and bottom grid edges
    pub window: PixelWindow,
}

/// Non-overlapping square tiles over a `rows` x `cols` pixel grid.
///
/// Every pixel belongs to exactly one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
    side: usize,
}

impl TileGrid {
    /// A zero side is treated as one pixel
    pub fn new(rows: usize, cols: usize, side: usize) -> Self {
        Self {
            rows,
            cols,
            side: side.max(1),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.side
    }

    /// `(tiles down, tiles across)`
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.div_ceil(self.side), self.cols.div_ceil(self.side))
    }

    pub fn len(&self) -> usize {
        let (down, across) = self.shape();
        down * across
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the tile holding pixel `(row, col)`
    pub fn index_of(&self, row: usize, col: usize) -> Option<usize> {
        (row < self.rows && col < self.cols)
            .then(|| (row / self.side) * self.shape().1 + col / self.side)
    }

    pub fn tile(&self, index: usize) -> Option<Tile> {
        if index >= self.len() {
            return None;
        }
        let across = self.shape().1;
        let row_off = (index / across) * self.side;
        let col_off = (index % across) * self.side;
        let window = PixelWindow::new(
            row_off,
            col_off,
            self.side.min(self.rows - row_off),
            self.side.min(self.cols - col_off),
        );
        Some(Tile { index, window })
    }

    /// Tiles in row-major order
    pub fn iter(&self) -> std::vec::IntoIter<Tile> {
        (0..self.len())
            .filter_map(|i| self.tile(i))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl<'a> IntoIterator for &'a TileGrid {
    type Item = Tile;
    type IntoIter = std::vec::IntoIter<Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
