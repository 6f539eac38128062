#![allow(dead_code)]

use geo_types::polygon;
use ndarray::Array3;
use phytostat_core::{
    CRS, Error, Feature, FeatureCollection, GeoTransform, MemoryRaster, PixelWindow, RasterAccess,
    RasterMetadata,
};
use phytostat_extract::{CancellationToken, RegisteredSource, SourceKind, SourceSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const EPSG: u32 = 32619;
pub const NODATA: f64 = -9999.0;

/// 100 x 100 grid of 1 m pixels with its upper-left corner at (0, 100)
pub fn fine_transform() -> GeoTransform {
    GeoTransform::new(0.0, 100.0, 1.0, -1.0)
}

/// 10 x 10 grid of 10 m pixels over the same extent
pub fn coarse_transform() -> GeoTransform {
    GeoTransform::new(0.0, 100.0, 10.0, -10.0)
}

/// Two-band 1 m raster: band 0 is `row * 100 + col`, band 1 is `row + col`
pub fn hsi_raster() -> MemoryRaster<f32> {
    let data = Array3::from_shape_fn((2, 100, 100), |(b, r, c)| match b {
        0 => (r * 100 + c) as f32,
        _ => (r + c) as f32,
    });
    MemoryRaster::new(data, fine_transform()).with_crs(CRS::from_epsg(EPSG))
}

/// One-band 10 m raster with value `row * 10 + col`, nodata in cell (0, 0)
pub fn chm_raster() -> MemoryRaster<f32> {
    let data = Array3::from_shape_fn((1, 10, 10), |(_, r, c)| {
        if r == 0 && c == 0 {
            NODATA as f32
        } else {
            (r * 10 + c) as f32
        }
    });
    MemoryRaster::new(data, coarse_transform())
        .with_crs(CRS::from_epsg(EPSG))
        .with_nodata(Some(NODATA))
}

/// One-band 2 m raster with a smooth gradient
pub fn thermal_raster() -> MemoryRaster<f32> {
    let data = Array3::from_shape_fn((1, 50, 50), |(_, r, c)| 20.0 + 0.25 * r as f32 + 0.5 * c as f32);
    MemoryRaster::new(data, GeoTransform::new(0.0, 100.0, 2.0, -2.0))
        .with_crs(CRS::from_epsg(EPSG))
}

pub fn hsi_source() -> RegisteredSource {
    RegisteredSource::new("hsi", Arc::new(hsi_raster()), SourceKind::Passive)
        .with_labels(vec!["blue", "green"])
}

pub fn chm_source() -> RegisteredSource {
    RegisteredSource::new("chm", Arc::new(chm_raster()), SourceKind::Active).with_labels(vec!["chm"])
}

pub fn thermal_source() -> RegisteredSource {
    RegisteredSource::new("thermal", Arc::new(thermal_raster()), SourceKind::Passive)
        .with_labels(vec!["lst"])
}

pub fn fused_sources() -> SourceSet {
    SourceSet::new(vec![hsi_source(), chm_source(), thermal_source()]).unwrap()
}

/// Axis-aligned square with its lower-left corner at `(x, y)`
pub fn square(id: &str, x: f64, y: f64, size: f64) -> Feature {
    Feature::new(
        id,
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
        ],
    )
}

pub fn collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection::from_features(CRS::from_epsg(EPSG), features)
}

/// Squares scattered over the grid, several straddling 16 px tile edges
pub fn scattered_crowns(n: usize) -> FeatureCollection {
    let features = (0..n)
        .map(|i| {
            let x = 3.0 + ((i * 37) % 85) as f64 + 0.3;
            let y = 4.0 + ((i * 53) % 83) as f64 + 0.6;
            let size = 2.5 + (i % 5) as f64 * 1.5;
            square(&format!("crown-{:03}", n - i), x, y, size)
        })
        .collect();
    collection(features)
}

/// Raster wrapper counting reads and the most reads in flight at once,
/// optionally failing reads that touch a pixel or cancelling a token on its
/// first read
pub struct ProbeRaster {
    inner: MemoryRaster<f32>,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    fail_at: Option<(usize, usize)>,
    cancel_on_read: Option<CancellationToken>,
}

impl ProbeRaster {
    pub fn new(inner: MemoryRaster<f32>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            fail_at: None,
            cancel_on_read: None,
        }
    }

    pub fn failing_at(mut self, row: usize, col: usize) -> Self {
        self.fail_at = Some((row, col));
        self
    }

    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_read = Some(token);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl RasterAccess for ProbeRaster {
    fn metadata(&self) -> &RasterMetadata {
        self.inner.metadata()
    }

    fn read_window(&self, window: &PixelWindow, bands: &[usize]) -> phytostat_core::Result<Array3<f64>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_read {
            token.cancel();
        }
        let result = match self.fail_at {
            Some((row, col)) if window.contains(row, col) => {
                Err(Error::Other("simulated disk failure".into()))
            }
            _ => self.inner.read_window(window, bands),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
