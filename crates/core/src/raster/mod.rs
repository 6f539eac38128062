//! Raster grids, windows and the windowed-read contract

mod access;
mod element;
mod geotransform;
mod memory;
mod window;

pub use access::{RasterAccess, RasterMetadata};
pub use element::{DataType, RasterElement};
pub use geotransform::GeoTransform;
pub use memory::MemoryRaster;
pub use window::PixelWindow;
