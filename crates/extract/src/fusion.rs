//! Multi-source registration and pixel-level fusion
//!
//! Several co-registered rasters (for example optical imagery and a lidar
//! canopy height model) are resampled onto the finest registered grid. Their
//! bands are concatenated in registration order, and their validity masks
//! are intersected.

use ndarray::{Array2, Array3};
use phytostat_core::{CRS, GeoTransform, PixelWindow, RasterAccess, RasterMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ExtractError, Result};
use crate::reader::PixelBlock;

/// Pixel areas within this relative distance count as equal resolution
const AREA_TIE_RTOL: f64 = 1e-9;

/// Sensor family of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Optical reflectance (continuous)
    Passive,
    /// Lidar/radar derived layers (heights, classes)
    Active,
}

impl SourceKind {
    /// Resampling used unless the source declares one
    pub fn default_resampling(self) -> Resampling {
        match self {
            SourceKind::Passive => Resampling::Bilinear,
            SourceKind::Active => Resampling::Nearest,
        }
    }
}

impl FromStr for SourceKind {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passive" | "optical" => Ok(SourceKind::Passive),
            "active" | "lidar" => Ok(SourceKind::Active),
            other => Err(ExtractError::InvalidConfig(format!(
                "unknown source kind '{other}' (expected passive or active)"
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Passive => "passive",
            SourceKind::Active => "active",
        })
    }
}

/// How a secondary source is sampled at reference pixel centres
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    Nearest,
    Bilinear,
}

impl FromStr for Resampling {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            other => Err(ExtractError::InvalidConfig(format!(
                "unknown resampling '{other}' (expected nearest or bilinear)"
            ))),
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resampling::Nearest => "nearest",
            Resampling::Bilinear => "bilinear",
        })
    }
}

/// One raster registered for a run: the data handle plus the band
/// selection, labels, sensor kind and resampling method.
#[derive(Clone)]
pub struct RegisteredSource {
    name: String,
    access: Arc<dyn RasterAccess>,
    kind: SourceKind,
    resampling: Resampling,
    bands: Vec<usize>,
    labels: Vec<String>,
}

impl RegisteredSource {
    /// Register every band of `access`. Labels come from the band
    /// descriptions, falling back to `b1`, `b2`, ...
    pub fn new(name: impl Into<String>, access: Arc<dyn RasterAccess>, kind: SourceKind) -> Self {
        let bands: Vec<usize> = (0..access.metadata().band_count).collect();
        let labels = default_labels(access.metadata(), &bands);
        Self {
            name: name.into(),
            access,
            kind,
            resampling: kind.default_resampling(),
            bands,
            labels,
        }
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    /// Select bands (0-based); labels are reset to the defaults
    pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
        self.labels = default_labels(self.access.metadata(), &bands);
        self.bands = bands;
        self
    }

    pub fn with_labels<S: Into<String>>(mut self, labels: Vec<S>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Prefix every label with `<prefix>_`
    pub fn with_label_prefix(mut self, prefix: &str) -> Self {
        self.labels = self
            .labels
            .iter()
            .map(|l| format!("{prefix}_{l}"))
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> &dyn RasterAccess {
        self.access.as_ref()
    }

    pub fn metadata(&self) -> &RasterMetadata {
        self.access.metadata()
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn resampling(&self) -> Resampling {
        self.resampling
    }

    pub fn bands(&self) -> &[usize] {
        &self.bands
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Bytes of selected pixel data per source pixel
    pub fn bytes_per_pixel(&self) -> usize {
        self.bands.len() * self.metadata().data_type.byte_width()
    }
}

impl fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("resampling", &self.resampling)
            .field("bands", &self.bands)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

fn default_labels(meta: &RasterMetadata, bands: &[usize]) -> Vec<String> {
    bands
        .iter()
        .map(|&b| {
            meta.band_descriptions
                .get(b)
                .cloned()
                .flatten()
                .unwrap_or_else(|| format!("b{}", b + 1))
        })
        .collect()
}

/// The pixel grid every fused block is expressed on
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferenceGrid {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

/// Sources registered for one run, validated together.
///
/// Dropping the set releases every source handle.
#[derive(Debug)]
pub struct SourceSet {
    sources: Vec<RegisteredSource>,
    reference: usize,
}

impl SourceSet {
    /// Validate and register sources in priority order.
    ///
    /// Fails with `NoSources`, `CrsMismatch`, `BandCollision` or a band
    /// range error before any pixel is read.
    pub fn new(sources: Vec<RegisteredSource>) -> Result<Self> {
        if sources.is_empty() {
            return Err(ExtractError::NoSources);
        }

        for source in &sources {
            validate_source(source)?;
        }
        check_crs(&sources)?;
        check_band_labels(&sources)?;

        let mut reference = 0;
        for (i, source) in sources.iter().enumerate().skip(1) {
            let best = sources[reference].metadata().transform.pixel_area();
            let area = source.metadata().transform.pixel_area();
            if area < best * (1.0 - AREA_TIE_RTOL) {
                reference = i;
            }
        }

        info!(
            "registered {} source(s), reference grid '{}' ({}x{} px)",
            sources.len(),
            sources[reference].name(),
            sources[reference].metadata().width,
            sources[reference].metadata().height
        );

        Ok(Self { sources, reference })
    }

    /// Convenience for a single-source run
    pub fn single(source: RegisteredSource) -> Result<Self> {
        Self::new(vec![source])
    }

    pub fn sources(&self) -> &[RegisteredSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn reference_index(&self) -> usize {
        self.reference
    }

    pub fn reference(&self) -> &RegisteredSource {
        &self.sources[self.reference]
    }

    pub fn reference_grid(&self) -> ReferenceGrid {
        let meta = self.reference().metadata();
        ReferenceGrid {
            transform: meta.transform,
            rows: meta.height,
            cols: meta.width,
        }
    }

    /// CRS shared by the sources, if any declares one
    pub fn crs(&self) -> Option<&CRS> {
        self.sources.iter().find_map(|s| s.metadata().crs.as_ref())
    }

    /// Fused band labels in registration order
    pub fn labels(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|s| s.labels().iter().cloned())
            .collect()
    }

    pub fn band_count(&self) -> usize {
        self.sources.iter().map(|s| s.bands().len()).sum()
    }

    /// Source names joined for the `raster_source` output column
    pub fn names(&self) -> String {
        self.sources
            .iter()
            .map(RegisteredSource::name)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Estimated bytes held per reference pixel across all sources.
    ///
    /// A source coarser than the reference contributes proportionally fewer
    /// bytes.
    pub fn bytes_per_reference_pixel(&self) -> f64 {
        let ref_area = self.reference().metadata().transform.pixel_area();
        self.sources
            .iter()
            .map(|s| {
                let ratio = ref_area / s.metadata().transform.pixel_area();
                s.bytes_per_pixel() as f64 * ratio
            })
            .sum()
    }

    /// Window of `source` needed to resample `window` of the reference grid.
    ///
    /// One extra pixel is read on each side so that bilinear neighbours are
    /// always present when the raster has them. `None` when the source does
    /// not overlap the window.
    pub fn source_window(&self, source: usize, window: &PixelWindow) -> Option<PixelWindow> {
        if source == self.reference {
            return Some(*window);
        }
        let bounds = self.reference_grid().transform.window_bounds(window);
        let meta = self.sources[source].metadata();
        PixelWindow::covering(&bounds, &meta.transform, meta.height, meta.width)
            .map(|w| w.expanded(1, meta.height, meta.width))
    }

    /// Resample per-source blocks onto `window` of the reference grid.
    ///
    /// `blocks` holds one entry per source in registration order; `None`
    /// marks a source that does not overlap the window. A reference pixel is
    /// valid only when every source has a valid value there.
    pub fn fuse(&self, window: &PixelWindow, blocks: Vec<Option<PixelBlock>>) -> Result<FusedBlock> {
        if blocks.len() != self.sources.len() {
            return Err(ExtractError::InvalidConfig(format!(
                "expected {} source blocks, got {}",
                self.sources.len(),
                blocks.len()
            )));
        }

        let (rows, cols) = (window.height, window.width);
        let mut data = Array3::<f64>::from_elem((self.band_count(), rows, cols), f64::NAN);
        let mut valid = Array2::from_elem((rows, cols), true);
        let ref_transform = self.reference_grid().transform;

        let mut band_offset = 0;
        for (i, (source, block)) in self.sources.iter().zip(blocks).enumerate() {
            let n_bands = source.bands().len();
            match block {
                None => valid.fill(false),
                Some(block) if i == self.reference => {
                    if block.window != *window {
                        return Err(ExtractError::InvalidConfig(format!(
                            "reference block covers {} instead of {}",
                            block.window, window
                        )));
                    }
                    data.slice_mut(ndarray::s![band_offset..band_offset + n_bands, .., ..])
                        .assign(&block.data);
                    valid.zip_mut_with(&block.valid, |v, &b| *v = *v && b);
                }
                Some(block) => {
                    resample_into(
                        &block,
                        &source.metadata().transform,
                        source.resampling(),
                        &ref_transform,
                        window,
                        band_offset,
                        &mut data,
                        &mut valid,
                    );
                }
            }
            band_offset += n_bands;
        }

        Ok(FusedBlock {
            pixels: PixelBlock::new(*window, data, valid),
        })
    }
}

fn validate_source(source: &RegisteredSource) -> Result<()> {
    let meta = source.metadata();
    if source.bands().is_empty() {
        return Err(ExtractError::InvalidConfig(format!(
            "source '{}' selects no band",
            source.name()
        )));
    }
    if let Some(&band) = source.bands().iter().find(|&&b| b >= meta.band_count) {
        return Err(phytostat_core::Error::BandOutOfRange {
            band,
            count: meta.band_count,
        }
        .into());
    }
    if source.labels().len() != source.bands().len() {
        return Err(ExtractError::InvalidConfig(format!(
            "source '{}' has {} labels for {} bands",
            source.name(),
            source.labels().len(),
            source.bands().len()
        )));
    }
    let area = meta.transform.pixel_area();
    if !area.is_finite() || area <= 0.0 {
        return Err(ExtractError::InvalidConfig(format!(
            "source '{}' has a degenerate geotransform",
            source.name()
        )));
    }
    Ok(())
}

fn check_crs(sources: &[RegisteredSource]) -> Result<()> {
    let mut declared = sources
        .iter()
        .filter_map(|s| s.metadata().crs.as_ref().map(|crs| (s.name(), crs)));

    if let Some((_, first)) = declared.next() {
        for (name, crs) in declared {
            if !crs.is_equivalent(first) {
                return Err(ExtractError::CrsMismatch {
                    expected: first.identifier(),
                    found: crs.identifier(),
                    context: format!("source '{name}'"),
                });
            }
        }
        if let Some(s) = sources.iter().find(|s| s.metadata().crs.is_none()) {
            warn!("source '{}' declares no CRS, assuming {}", s.name(), first);
        }
    }
    Ok(())
}

fn check_band_labels(sources: &[RegisteredSource]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for source in sources {
        for label in source.labels() {
            if let Some(first) = seen.insert(label.as_str(), source.name()) {
                return Err(ExtractError::BandCollision {
                    label: label.clone(),
                    first: first.to_string(),
                    second: source.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Sample `block` (on its own grid) at every reference pixel centre of
/// `window` and write the bands starting at `band_offset`.
#[allow(clippy::too_many_arguments)]
fn resample_into(
    block: &PixelBlock,
    src_transform: &GeoTransform,
    resampling: Resampling,
    ref_transform: &GeoTransform,
    window: &PixelWindow,
    band_offset: usize,
    data: &mut Array3<f64>,
    valid: &mut Array2<bool>,
) {
    let n_bands = block.band_count();

    for r in 0..window.height {
        for c in 0..window.width {
            let (x, y) = ref_transform.pixel_to_geo(window.col_off + c, window.row_off + r);
            let (sc, sr) = src_transform.geo_to_pixel(x, y);
            let nearest = (sr.floor() as i64, sc.floor() as i64);

            if !block.is_valid(nearest.0, nearest.1) {
                valid[[r, c]] = false;
                continue;
            }

            match resampling {
                Resampling::Nearest => {
                    for b in 0..n_bands {
                        data[[band_offset + b, r, c]] =
                            block.value(b, nearest.0, nearest.1).unwrap_or(f64::NAN);
                    }
                }
                Resampling::Bilinear => {
                    let neighbours = bilinear_weights(sr, sc);
                    let total: f64 = neighbours
                        .iter()
                        .filter(|(row, col, _)| block.is_valid(*row, *col))
                        .map(|(_, _, w)| w)
                        .sum();
                    for b in 0..n_bands {
                        let sum: f64 = neighbours
                            .iter()
                            .filter_map(|&(row, col, w)| {
                                block
                                    .is_valid(row, col)
                                    .then(|| block.value(b, row, col).map(|v| v * w))
                                    .flatten()
                            })
                            .sum();
                        data[[band_offset + b, r, c]] = sum / total;
                    }
                }
            }
        }
    }
}

/// The four pixels around a fractional position with their bilinear
/// weights, as `(row, col, weight)`
fn bilinear_weights(row: f64, col: f64) -> [(i64, i64, f64); 4] {
    let u = col - 0.5;
    let v = row - 0.5;
    let c0 = u.floor();
    let r0 = v.floor();
    let fx = u - c0;
    let fy = v - r0;
    let (r0, c0) = (r0 as i64, c0 as i64);
    [
        (r0, c0, (1.0 - fx) * (1.0 - fy)),
        (r0, c0 + 1, fx * (1.0 - fy)),
        (r0 + 1, c0, (1.0 - fx) * fy),
        (r0 + 1, c0 + 1, fx * fy),
    ]
}

/// Pixels of all sources on one reference window.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedBlock {
    pub pixels: PixelBlock,
}

impl FusedBlock {
    pub fn window(&self) -> &PixelWindow {
        &self.pixels.window
    }

    /// The part of this block inside `window`, restricted to `geometry`.
    ///
    /// `transform` is the reference grid transform. Returns `None` when the
    /// window is not inside the block.
    pub fn feature_pixels(
        &self,
        window: &PixelWindow,
        geometry: &geo_types::Geometry<f64>,
        transform: &GeoTransform,
    ) -> Option<PixelBlock> {
        let mut pixels = self.pixels.crop(window)?;
        pixels.restrict_to_geometry(geometry, transform);
        Some(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phytostat_core::MemoryRaster;

    fn memory(
        bands: usize,
        size: usize,
        transform: GeoTransform,
        f: impl Fn(usize, usize, usize) -> f32,
    ) -> Arc<dyn RasterAccess> {
        let data = Array3::from_shape_fn((bands, size, size), |(b, r, c)| f(b, r, c));
        Arc::new(MemoryRaster::new(data, transform).with_crs(CRS::from_epsg(32619)))
    }

    #[test]
    fn test_reference_is_finest_grid() {
        let coarse = memory(1, 2, GeoTransform::new(0.0, 20.0, 10.0, -10.0), |_, _, _| 1.0);
        let fine = memory(1, 20, GeoTransform::new(0.0, 20.0, 1.0, -1.0), |_, _, _| 1.0);
        let set = SourceSet::new(vec![
            RegisteredSource::new("chm", coarse, SourceKind::Active),
            RegisteredSource::new("hsi", fine, SourceKind::Passive).with_label_prefix("hsi"),
        ])
        .unwrap();
        assert_eq!(set.reference_index(), 1);
        assert_eq!(set.labels(), vec!["b1".to_string(), "hsi_b1".to_string()]);
        assert_eq!(set.names(), "chm;hsi");
    }

    #[test]
    fn test_equal_resolution_tie_keeps_first() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let a = memory(1, 10, gt, |_, _, _| 1.0);
        let b = memory(1, 10, gt, |_, _, _| 2.0);
        let set = SourceSet::new(vec![
            RegisteredSource::new("a", a, SourceKind::Passive).with_labels(vec!["a"]),
            RegisteredSource::new("b", b, SourceKind::Passive).with_labels(vec!["b"]),
        ])
        .unwrap();
        assert_eq!(set.reference_index(), 0);
    }

    #[test]
    fn test_band_collision_rejected() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let err = SourceSet::new(vec![
            RegisteredSource::new("a", memory(2, 10, gt, |_, _, _| 1.0), SourceKind::Passive),
            RegisteredSource::new("b", memory(1, 10, gt, |_, _, _| 1.0), SourceKind::Active),
        ])
        .unwrap_err();
        match err {
            ExtractError::BandCollision { label, first, second } => {
                assert_eq!((label.as_str(), first.as_str(), second.as_str()), ("b1", "a", "b"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_crs_mismatch_rejected() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let other = Arc::new(
            MemoryRaster::new(Array3::<f32>::zeros((1, 10, 10)), gt).with_crs(CRS::from_epsg(4326)),
        );
        let err = SourceSet::new(vec![
            RegisteredSource::new("a", memory(1, 10, gt, |_, _, _| 1.0), SourceKind::Passive),
            RegisteredSource::new("b", other, SourceKind::Active).with_labels(vec!["h"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ExtractError::CrsMismatch { .. }));
    }

    #[test]
    fn test_empty_and_out_of_range_bands() {
        assert!(matches!(SourceSet::new(vec![]), Err(ExtractError::NoSources)));

        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let src = RegisteredSource::new("a", memory(2, 10, gt, |_, _, _| 1.0), SourceKind::Passive)
            .with_bands(vec![0, 5]);
        assert!(matches!(SourceSet::single(src), Err(ExtractError::Core(_))));
    }

    #[test]
    fn test_bytes_per_reference_pixel_scales_with_resolution() {
        // f32 fine source with 4 bands, f32 coarse source (10x coarser) with 1 band
        let fine = memory(4, 20, GeoTransform::new(0.0, 20.0, 1.0, -1.0), |_, _, _| 1.0);
        let coarse = memory(1, 2, GeoTransform::new(0.0, 20.0, 10.0, -10.0), |_, _, _| 1.0);
        let set = SourceSet::new(vec![
            RegisteredSource::new("fine", fine, SourceKind::Passive),
            RegisteredSource::new("coarse", coarse, SourceKind::Active).with_labels(vec!["h"]),
        ])
        .unwrap();
        approx::assert_relative_eq!(set.bytes_per_reference_pixel(), 16.04, epsilon = 1e-12);
    }

    #[test]
    fn test_bilinear_weights_sum_to_one() {
        let w = bilinear_weights(3.3, 7.9);
        let total: f64 = w.iter().map(|(_, _, w)| w).sum();
        approx::assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert_eq!((w[0].0, w[0].1), (2, 7));
    }

    #[test]
    fn test_bilinear_resampling_interpolates_and_renormalizes() {
        // Secondary grid 2x coarser, values = col index
        let fine = memory(1, 8, GeoTransform::new(0.0, 8.0, 1.0, -1.0), |_, _, _| 1.0);
        let coarse = memory(1, 4, GeoTransform::new(0.0, 8.0, 2.0, -2.0), |_, _, c| c as f32);
        let set = SourceSet::new(vec![
            RegisteredSource::new("fine", fine, SourceKind::Passive).with_labels(vec!["f"]),
            RegisteredSource::new("coarse", coarse, SourceKind::Passive).with_labels(vec!["c"]),
        ])
        .unwrap();
        assert_eq!(set.reference_index(), 0);

        let window = PixelWindow::new(2, 2, 2, 2);
        let src_window = set.source_window(1, &window).unwrap();
        assert_eq!(src_window, PixelWindow::new(0, 0, 3, 3));

        let blocks = set
            .sources()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let w = set.source_window(i, &window).unwrap();
                crate::reader::WindowedReader::new(s, None).read(&w).unwrap()
            })
            .collect();
        let fused = set.fuse(&window, blocks).unwrap();

        // Fine pixel col 2 centre x=2.5 -> coarse col 1.25 -> between cols 0 and 1
        approx::assert_relative_eq!(fused.pixels.data[[1, 0, 0]], 0.75, epsilon = 1e-12);
        // Fine pixel col 3 centre x=3.5 -> coarse col 1.75 -> between cols 1 and 2
        approx::assert_relative_eq!(fused.pixels.data[[1, 0, 1]], 1.25, epsilon = 1e-12);
        assert_eq!(fused.pixels.valid_count(), 4);
    }
}
