//! Raster storage backends

mod geotiff;

pub use geotiff::GeoTiffRaster;
