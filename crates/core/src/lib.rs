//! # phytostat core
//!
//! Core types shared by the phytostat extraction engine.
//!
//! This crate provides:
//! - `GeoTransform`: affine georeferencing of a pixel grid
//! - `PixelWindow` and `BBox`: pixel-space and map-space rectangles
//! - `RasterAccess`: the windowed-read contract every raster source implements
//! - `MemoryRaster` and `GeoTiffRaster`: in-memory and on-disk implementations
//! - `Feature` / `FeatureCollection`: vector records with a declared `CRS`

pub mod bbox;
pub mod crs;
pub mod error;
pub mod io;
pub mod raster;
pub mod vector;

pub use bbox::BBox;
pub use crs::CRS;
pub use io::GeoTiffRaster;
pub use error::{Error, Result};
pub use raster::{
    DataType, GeoTransform, MemoryRaster, PixelWindow, RasterAccess, RasterElement,
    RasterMetadata,
};
pub use vector::{AttributeValue, Feature, FeatureCollection, FeatureId};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bbox::BBox;
    pub use crate::crs::CRS;
    pub use crate::error::{Error, Result};
    pub use crate::io::GeoTiffRaster;
    pub use crate::raster::{
        DataType, GeoTransform, MemoryRaster, PixelWindow, RasterAccess, RasterElement,
        RasterMetadata,
    };
    pub use crate::vector::{AttributeValue, Feature, FeatureCollection, FeatureId};
}
