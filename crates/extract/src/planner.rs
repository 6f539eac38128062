//! Window planning
//!
//! Maps every feature to its minimal pixel window on the reference grid and
//! groups the windows into work units:
//!
//! - `WholeRead`: one unit whose window is the union of all feature windows
//! - `Tiled`: square tiles; a feature belongs to the tile containing the
//!   centre pixel of its window, and the unit reads the union of its
//!   features' windows, so every feature is aggregated over its full footprint
//! - `PerFeature`: one unit per feature
//!
//! The plan is fully deterministic, and the memory budget is checked before
//! any pixel is read: the units that may run at the same time must fit the
//! budget together, so the plan lowers its concurrency when the largest
//! units do not.

use phytostat_core::PixelWindow;
use phytostat_parallel::TileGrid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TileMode;
use crate::error::{ExtractError, Result};
use crate::fusion::ReferenceGrid;
use crate::index::GeometryIndex;

/// Share of the memory budget that concurrent tiles may use
pub const BUDGET_FRACTION: f64 = 0.7;

/// How the run reads pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    WholeRead,
    Tiled { tile_size: usize },
    PerFeature,
}

/// One read window and the features aggregated from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub index: usize,
    /// Read window on the reference grid
    pub window: PixelWindow,
    /// Slots of the features aggregated from this unit, ascending
    pub features: Vec<usize>,
}

/// Result of planning a run
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub strategy: Strategy,
    pub units: Vec<WorkUnit>,
    /// Window of every feature on the reference grid; `None` when the
    /// feature does not touch the raster
    pub feature_windows: Vec<Option<PixelWindow>>,
    /// Slots of the features outside the raster extent
    pub out_of_bounds: Vec<usize>,
    /// Estimated bytes per reference pixel across all sources
    pub bytes_per_pixel: f64,
    /// Units read at the same time; at most the configured concurrency limit
    pub concurrency: usize,
    /// Estimated bytes held by concurrently processed units, within the
    /// memory budget
    pub estimated_peak_bytes: u64,
}

impl Plan {
    /// Number of features assigned to a work unit
    pub fn planned_features(&self) -> usize {
        self.units.iter().map(|u| u.features.len()).sum()
    }
}

/// Inputs of [`plan`]
pub struct PlanRequest<'i, 'f> {
    pub index: &'i GeometryIndex<'f>,
    pub grid: ReferenceGrid,
    pub bytes_per_pixel: f64,
    pub memory_budget_bytes: u64,
    pub mode: TileMode,
    /// Upper bound on the tile side
    pub tile_size: Option<usize>,
    pub concurrency_limit: usize,
}

impl PlanRequest<'_, '_> {
    fn footprint(&self, pixels: usize) -> u64 {
        (pixels as f64 * self.bytes_per_pixel).ceil() as u64
    }
}

/// Plan a run.
///
/// Fails with `MemoryBudgetExceeded` when a single feature window does not
/// fit the budget, or when a tiled plan cannot fit even one-pixel tiles for
/// every worker. A tiled unit larger than the tile footprint is split into
/// smaller groups of features.
pub fn plan(request: &PlanRequest<'_, '_>) -> Result<Plan> {
    let index = request.index;
    let grid = &request.grid;
    let budget = request.memory_budget_bytes;

    let mut feature_windows = Vec::with_capacity(index.len());
    let mut out_of_bounds = Vec::new();
    for slot in 0..index.len() {
        let window =
            PixelWindow::covering(&index.bounds(slot), &grid.transform, grid.rows, grid.cols);
        match window {
            Some(w) => {
                let required = request.footprint(w.pixel_count());
                if required > budget {
                    return Err(ExtractError::MemoryBudgetExceeded {
                        budget,
                        required,
                        what: format!("the window {} of feature '{}'", w, index.feature(slot).id),
                    });
                }
            }
            None => {
                warn!("feature '{}' lies outside the raster extent", index.feature(slot).id);
                out_of_bounds.push(slot);
            }
        }
        feature_windows.push(window);
    }

    let in_bounds: Vec<usize> = (0..index.len())
        .filter(|&s| feature_windows[s].is_some())
        .collect();

    let whole_bytes = request.footprint(grid.rows * grid.cols);
    let strategy = match request.mode {
        TileMode::PerFeature => Strategy::PerFeature,
        TileMode::Auto if whole_bytes < budget => Strategy::WholeRead,
        TileMode::Auto | TileMode::Tiled => Strategy::Tiled {
            tile_size: tile_size(request)?,
        },
    };

    let units = match strategy {
        Strategy::PerFeature => in_bounds
            .iter()
            .enumerate()
            .filter_map(|(i, &slot)| {
                feature_windows[slot].map(|window| WorkUnit {
                    index: i,
                    window,
                    features: vec![slot],
                })
            })
            .collect(),
        Strategy::WholeRead => union_window(&feature_windows, &in_bounds)
            .map(|window| WorkUnit {
                index: 0,
                window,
                features: in_bounds.clone(),
            })
            .into_iter()
            .collect(),
        Strategy::Tiled { tile_size } => {
            tiled_units(request, tile_size, &feature_windows, &in_bounds)
        }
    };

    let footprints: Vec<u64> = units
        .iter()
        .map(|u| request.footprint(u.window.pixel_count()))
        .collect();
    let (concurrency, estimated_peak_bytes) =
        fit_concurrency(footprints, request.concurrency_limit, budget)?;

    info!(
        "planned {:?}: {} unit(s) for {} feature(s), {} outside the raster, {} concurrent",
        strategy,
        units.len(),
        in_bounds.len(),
        out_of_bounds.len(),
        concurrency
    );

    Ok(Plan {
        strategy,
        units,
        feature_windows,
        out_of_bounds,
        bytes_per_pixel: request.bytes_per_pixel,
        concurrency,
        estimated_peak_bytes,
    })
}

/// Largest number of units that may run together such that the biggest of
/// them fit the budget at once, and their combined footprint.
fn fit_concurrency(mut footprints: Vec<u64>, limit: usize, budget: u64) -> Result<(usize, u64)> {
    let limit = limit.max(1);
    footprints.sort_unstable_by(|a, b| b.cmp(a));

    let mut peak = 0u64;
    let mut concurrency = 0;
    for &bytes in footprints.iter().take(limit) {
        if peak + bytes > budget {
            break;
        }
        peak += bytes;
        concurrency += 1;
    }

    match footprints.first() {
        None => Ok((limit, 0)),
        Some(&largest) if concurrency == 0 => Err(ExtractError::MemoryBudgetExceeded {
            budget,
            required: largest,
            what: "the largest work unit".to_string(),
        }),
        Some(_) => {
            if concurrency < limit.min(footprints.len()) {
                warn!(
                    "concurrency lowered from {} to {} to keep {} bytes of work units within the budget of {} bytes",
                    limit, concurrency, peak, budget
                );
            }
            Ok((concurrency, peak))
        }
    }
}

/// Largest square tile such that `concurrency_limit` tiles stay under the
/// budget fraction, capped by the configured tile size.
fn tile_size(request: &PlanRequest<'_, '_>) -> Result<usize> {
    let workers = request.concurrency_limit.max(1) as f64;
    let per_tile = request.memory_budget_bytes as f64 * BUDGET_FRACTION / workers;
    let side = (per_tile / request.bytes_per_pixel).sqrt().floor();

    if !side.is_finite() || side < 1.0 {
        return Err(ExtractError::MemoryBudgetExceeded {
            budget: request.memory_budget_bytes,
            required: (request.bytes_per_pixel * workers / BUDGET_FRACTION).ceil() as u64,
            what: format!("one-pixel tiles for {} worker(s)", request.concurrency_limit),
        });
    }

    let side = side as usize;
    Ok(request.tile_size.map_or(side, |cap| side.min(cap)))
}

fn union_window(windows: &[Option<PixelWindow>], slots: &[usize]) -> Option<PixelWindow> {
    slots
        .iter()
        .filter_map(|&s| windows[s])
        .reduce(|a, b| a.union(&b))
}

fn tiled_units(
    request: &PlanRequest<'_, '_>,
    tile_size: usize,
    feature_windows: &[Option<PixelWindow>],
    in_bounds: &[usize],
) -> Vec<WorkUnit> {
    let grid = &request.grid;
    let tiles = TileGrid::new(grid.rows, grid.cols, tile_size);
    let tile_bytes = request.footprint(tile_size * tile_size);

    let mut owner = vec![None; feature_windows.len()];
    for &slot in in_bounds {
        if let Some(w) = feature_windows[slot] {
            let (row, col) = w.center();
            owner[slot] = tiles.index_of(row, col);
        }
    }

    let mut units = Vec::new();
    for tile in &tiles {
        // One pixel of slack so that features whose bounds stop just short
        // of their centre pixel are still found.
        let search = tile.window.expanded(1, grid.rows, grid.cols);
        let bounds = grid.transform.window_bounds(&search);
        let slots: Vec<usize> = request
            .index
            .query_slots(&bounds)
            .into_iter()
            .filter(|&s| owner[s] == Some(tile.index))
            .collect();

        for (window, features) in group_within(request, feature_windows, &slots, tile_bytes) {
            debug!(
                "tile {} {}: {} feature(s), read window {}",
                tile.index,
                tile.window,
                features.len(),
                window
            );
            units.push(WorkUnit {
                index: units.len(),
                window,
                features,
            });
        }
    }

    debug_assert_eq!(
        units.iter().map(|u| u.features.len()).sum::<usize>(),
        in_bounds.len()
    );
    units
}

/// Split the features of one tile into groups whose union window stays
/// within `max_bytes`. A feature larger than `max_bytes` forms its own group.
fn group_within(
    request: &PlanRequest<'_, '_>,
    feature_windows: &[Option<PixelWindow>],
    slots: &[usize],
    max_bytes: u64,
) -> Vec<(PixelWindow, Vec<usize>)> {
    let mut groups: Vec<(PixelWindow, Vec<usize>)> = Vec::new();
    for &slot in slots {
        let Some(window) = feature_windows[slot] else {
            continue;
        };
        if let Some((union, members)) = groups.last_mut() {
            let merged = union.union(&window);
            if request.footprint(merged.pixel_count()) <= max_bytes {
                *union = merged;
                members.push(slot);
                continue;
            }
        }
        groups.push((window, vec![slot]));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{point, polygon};
    use phytostat_core::{Feature, GeoTransform};

    fn square(id: &str, x: f64, y: f64, size: f64) -> Feature {
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

    fn grid(size: usize) -> ReferenceGrid {
        ReferenceGrid {
            transform: GeoTransform::new(0.0, size as f64, 1.0, -1.0),
            rows: size,
            cols: size,
        }
    }

    fn request<'i, 'f>(index: &'i GeometryIndex<'f>, mode: TileMode, budget: u64) -> PlanRequest<'i, 'f> {
        PlanRequest {
            index,
            grid: grid(100),
            bytes_per_pixel: 4.0,
            memory_budget_bytes: budget,
            mode,
            tile_size: None,
            concurrency_limit: 2,
        }
    }

    #[test]
    fn test_auto_picks_whole_read_when_raster_fits() {
        let features = vec![square("a", 10.0, 10.0, 5.0), square("b", 60.0, 60.0, 5.0)];
        let index = GeometryIndex::build(&features).unwrap();
        let plan = plan(&request(&index, TileMode::Auto, 1_000_000)).unwrap();

        assert_eq!(plan.strategy, Strategy::WholeRead);
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].features, vec![0, 1]);
        // a: rows 85..90, cols 10..15; b: rows 35..40, cols 60..65
        assert_eq!(plan.units[0].window, PixelWindow::new(35, 10, 55, 55));
    }

    #[test]
    fn test_auto_tiles_when_raster_exceeds_budget() {
        let features = vec![square("a", 10.0, 10.0, 5.0)];
        let index = GeometryIndex::build(&features).unwrap();
        // 100x100x4 = 40_000 bytes > 20_000
        let plan = plan(&request(&index, TileMode::Auto, 20_000)).unwrap();

        // sqrt(20_000 * 0.7 / 2 / 4) = 41.8
        assert_eq!(plan.strategy, Strategy::Tiled { tile_size: 41 });
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].window, PixelWindow::new(85, 10, 5, 5));
    }

    #[test]
    fn test_configured_tile_size_caps_budget_size() {
        let features = vec![square("a", 10.0, 10.0, 5.0)];
        let index = GeometryIndex::build(&features).unwrap();
        let mut req = request(&index, TileMode::Tiled, 1_000_000);
        req.tile_size = Some(16);
        assert_eq!(plan(&req).unwrap().strategy, Strategy::Tiled { tile_size: 16 });
    }

    #[test]
    fn test_straddling_feature_assigned_to_centre_tile_once() {
        // Tiles of 10 px; feature spans cols 8..14 and rows 8..14, centre (10, 10)
        let features = vec![
            square("straddle", 8.0, 86.0, 6.0),
            square("inside", 1.0, 97.0, 2.0),
        ];
        let index = GeometryIndex::build(&features).unwrap();
        let mut req = request(&index, TileMode::Tiled, 1_000_000);
        req.tile_size = Some(10);
        let plan = plan(&req).unwrap();

        assert_eq!(plan.planned_features(), 2);
        let unit = plan
            .units
            .iter()
            .find(|u| u.features.contains(&0))
            .unwrap();
        assert_eq!(unit.features, vec![0]);
        assert_eq!(unit.window, PixelWindow::new(8, 8, 6, 6));
        assert_eq!(plan.units[0].features, vec![1]);
    }

    #[test]
    fn test_per_feature_and_out_of_bounds() {
        let features = vec![
            square("a", 10.0, 10.0, 5.0),
            square("outside", 500.0, 500.0, 5.0),
            Feature::new("p", point!(x: 50.5, y: 50.5)),
        ];
        let index = GeometryIndex::build(&features).unwrap();
        let plan = plan(&request(&index, TileMode::PerFeature, 1_000_000)).unwrap();

        assert_eq!(plan.strategy, Strategy::PerFeature);
        assert_eq!(plan.out_of_bounds, vec![1]);
        assert_eq!(plan.feature_windows[1], None);
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[1].window, PixelWindow::new(49, 50, 1, 1));
    }

    #[test]
    fn test_feature_window_over_budget_is_fatal() {
        let features = vec![square("big", 0.0, 0.0, 50.0)];
        let index = GeometryIndex::build(&features).unwrap();
        // 50x50x4 = 10_000 bytes
        let err = plan(&request(&index, TileMode::PerFeature, 9_999)).unwrap_err();
        match err {
            ExtractError::MemoryBudgetExceeded { budget, required, .. } => {
                assert_eq!((budget, required), (9_999, 10_000));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_no_one_pixel_tile_fits() {
        let features = vec![Feature::new("p", point!(x: 50.5, y: 50.5))];
        let index = GeometryIndex::build(&features).unwrap();
        // The 4-byte point window fits, but 2 workers need 4 * 2 / 0.7 bytes
        let result = plan(&request(&index, TileMode::Tiled, 8));
        assert!(matches!(result, Err(ExtractError::MemoryBudgetExceeded { .. })));
    }

    #[test]
    fn test_concurrency_lowered_to_fit_budget() {
        // Two 60x60 windows of 14_400 bytes each; both at once need 28_800
        let features = vec![square("a", 0.0, 40.0, 60.0), square("b", 40.0, 0.0, 60.0)];
        let index = GeometryIndex::build(&features).unwrap();
        let tight = plan(&request(&index, TileMode::PerFeature, 20_000)).unwrap();
        assert_eq!(tight.units.len(), 2);
        assert_eq!(tight.concurrency, 1);
        assert_eq!(tight.estimated_peak_bytes, 14_400);

        let roomy = plan(&request(&index, TileMode::PerFeature, 28_800)).unwrap();
        assert_eq!(roomy.concurrency, 2);
        assert_eq!(roomy.estimated_peak_bytes, 28_800);
    }

    #[test]
    fn test_oversized_tile_unit_is_split() {
        // Both centres fall in tile 0 of a 10 px grid, but the union of the
        // windows (13x13) is larger than the tile footprint (10x10)
        let features = vec![square("small", 0.0, 98.0, 2.0), square("wide", 5.0, 87.0, 8.0)];
        let index = GeometryIndex::build(&features).unwrap();
        let mut req = request(&index, TileMode::Tiled, 1_000_000);
        req.tile_size = Some(10);
        let plan = plan(&req).unwrap();

        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[0].features, vec![0]);
        assert_eq!(plan.units[0].window, PixelWindow::new(0, 0, 2, 2));
        assert_eq!(plan.units[1].features, vec![1]);
        assert_eq!(plan.units[1].window, PixelWindow::new(5, 5, 8, 8));
        assert!(plan.units.iter().all(|u| u.window.pixel_count() <= 100));
    }

    #[test]
    fn test_fit_concurrency() {
        assert_eq!(fit_concurrency(vec![10, 30, 20], 2, 100).unwrap(), (2, 50));
        assert_eq!(fit_concurrency(vec![10, 30, 20], 3, 45).unwrap(), (1, 30));
        assert_eq!(fit_concurrency(vec![], 4, 10).unwrap(), (4, 0));
        assert!(fit_concurrency(vec![11], 1, 10).is_err());
    }
}
