//! The extraction run
//!
//! Setup (config, CRS, identifiers, geometry index, plan) happens on the
//! calling thread and fails before any read. Work units are then read and
//! fused on a worker pool bounded by `concurrency_limit`; fused blocks flow
//! through a bounded channel back to the calling thread, which aggregates
//! them and fills the assembler.

use crossbeam_channel::{bounded, Receiver};
use phytostat_core::{Feature, FeatureCollection, GeoTransform, PixelWindow};
use phytostat_parallel::{ParallelStrategy, ProcessingMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

use crate::assemble::{Assembler, ResultTable, StatRecord};
use crate::cancel::CancellationToken;
use crate::config::{ExtractConfig, Statistic};
use crate::error::{ExtractError, FeatureStatus, Result};
use crate::fusion::{FusedBlock, SourceSet};
use crate::index::GeometryIndex;
use crate::planner::{self, Plan, PlanRequest, WorkUnit};
use crate::reader::WindowedReader;
use crate::stats::aggregate;

/// A read-and-fused work unit on its way to the aggregator
struct UnitOutcome {
    unit: usize,
    result: Result<FusedBlock>,
}

/// Everything the aggregator needs to turn blocks into records
struct RunContext<'a> {
    units: &'a [WorkUnit],
    features: &'a [Feature],
    feature_windows: &'a [Option<PixelWindow>],
    transform: GeoTransform,
    labels: &'a [String],
    statistics: &'a [Statistic],
    raster_source: &'a str,
    return_raw: bool,
    fail_fast: bool,
}

impl RunContext<'_> {
    fn null_record(&self, slot: usize, status: FeatureStatus) -> StatRecord {
        let feature = &self.features[slot];
        StatRecord::null(
            feature.id.clone(),
            status,
            self.raster_source,
            self.labels,
            self.statistics,
            feature.properties.clone(),
        )
    }

    fn feature_record(&self, slot: usize, block: &FusedBlock) -> StatRecord {
        let feature = &self.features[slot];
        let Some(window) = self.feature_windows[slot] else {
            return self.null_record(slot, FeatureStatus::WindowOutOfBounds);
        };
        let Some(pixels) = block.feature_pixels(&window, &feature.geometry, &self.transform) else {
            return self.null_record(
                slot,
                FeatureStatus::RasterIo(format!(
                    "feature window {} not inside read window {}",
                    window,
                    block.window()
                )),
            );
        };

        let bands = aggregate(
            pixels.data.view(),
            pixels.valid.view(),
            self.labels,
            self.statistics,
            self.return_raw,
        );
        let status = if pixels.valid_count() == 0 {
            FeatureStatus::NoValidPixels
        } else {
            FeatureStatus::Ok
        };

        StatRecord {
            id: feature.id.clone(),
            status,
            raster_source: self.raster_source.to_string(),
            bands,
            attributes: feature.properties.clone(),
        }
    }
}

/// Extract per-feature, per-band statistics from the fused sources.
///
/// The result holds exactly one record per input feature, in input order.
/// Features outside the raster get a `WindowOutOfBounds` row, failed reads
/// a `RasterIo` row and, after cancellation, unprocessed features a
/// `Cancelled` row. With `fail_fast` the first of these aborts the run
/// instead.
///
/// Cancellation is checked before each source read of a unit; a read
/// already in progress runs to completion.
///
/// # Example
/// ```
/// use geo_types::polygon;
/// use ndarray::Array3;
/// use phytostat_core::{CRS, Feature, FeatureCollection, GeoTransform, MemoryRaster, RasterAccess};
/// use phytostat_extract::{
///     extract, CancellationToken, ExtractConfig, RegisteredSource, SourceKind, SourceSet,
/// };
/// use std::sync::Arc;
///
/// let raster = MemoryRaster::new(Array3::<u16>::from_elem((2, 50, 50), 100), GeoTransform::new(0.0, 50.0, 1.0, -1.0))
///     .with_crs(CRS::from_epsg(32619));
/// let sources = SourceSet::single(RegisteredSource::new(
///     "hsi",
///     Arc::new(raster) as Arc<dyn RasterAccess>,
///     SourceKind::Passive,
/// ))
/// .unwrap();
///
/// let mut crowns = FeatureCollection::new(CRS::from_epsg(32619));
/// crowns.push(Feature::new("t1", polygon![(x: 10.0, y: 10.0), (x: 20.0, y: 10.0), (x: 20.0, y: 20.0), (x: 10.0, y: 20.0)]));
///
/// let table = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap();
/// assert_eq!(table.len(), 1);
/// assert_eq!(table.records[0].bands[0].mean, Some(100.0));
/// ```
pub fn extract(
    sources: &SourceSet,
    features: &FeatureCollection,
    config: &ExtractConfig,
    cancel: &CancellationToken,
) -> Result<ResultTable> {
    let config = config.validated()?;
    check_feature_crs(sources, features)?;

    let ids = features.iter().map(|f| f.id.clone()).collect();
    let mut assembler = Assembler::new(ids)?;
    let index = GeometryIndex::build(&features.features)?;
    let plan = planner::plan(&plan_request(&index, sources, &config))?;

    info!(
        "extracting {} feature(s) from {} source(s) with {} worker(s)",
        features.len(),
        sources.len(),
        plan.concurrency
    );

    let labels = sources.labels();
    let raster_source = sources.names();
    let ctx = RunContext {
        units: &plan.units,
        features: &features.features,
        feature_windows: &plan.feature_windows,
        transform: sources.reference_grid().transform,
        labels: &labels,
        statistics: &config.statistics,
        raster_source: &raster_source,
        return_raw: config.return_raw,
        fail_fast: config.fail_fast,
    };

    for &slot in &plan.out_of_bounds {
        if config.fail_fast {
            return Err(ExtractError::WindowOutOfBounds {
                id: features.features[slot].id.clone(),
            });
        }
        assembler.insert(slot, ctx.null_record(slot, FeatureStatus::WindowOutOfBounds))?;
    }

    run_units(sources, &plan, &config, cancel, &ctx, &mut assembler)?;

    if assembler.remaining() > 0 {
        if config.fail_fast {
            return Err(ExtractError::Cancelled);
        }
        warn!(
            "run cancelled, {} feature(s) not processed",
            assembler.remaining()
        );
    }

    let records = assembler.finish(|slot, _| ctx.null_record(slot, FeatureStatus::Cancelled));
    let table = ResultTable {
        id_column: "id".to_string(),
        statistics: config.statistics.clone(),
        band_labels: labels.clone(),
        attribute_names: features.attribute_names(),
        records,
    };

    info!("extraction finished: {:?}", table.status_counts());
    Ok(table)
}

/// Validate the inputs and plan a run without reading any pixel
pub fn plan_extraction(
    sources: &SourceSet,
    features: &FeatureCollection,
    config: &ExtractConfig,
) -> Result<Plan> {
    let config = config.validated()?;
    check_feature_crs(sources, features)?;
    Assembler::new(features.iter().map(|f| f.id.clone()).collect())?;
    let index = GeometryIndex::build(&features.features)?;
    planner::plan(&plan_request(&index, sources, &config))
}

fn plan_request<'i, 'f>(
    index: &'i GeometryIndex<'f>,
    sources: &SourceSet,
    config: &ExtractConfig,
) -> PlanRequest<'i, 'f> {
    PlanRequest {
        index,
        grid: sources.reference_grid(),
        bytes_per_pixel: sources.bytes_per_reference_pixel(),
        memory_budget_bytes: config.memory_budget_bytes,
        mode: config.tile_mode,
        tile_size: config.tile_size,
        concurrency_limit: config.concurrency_limit,
    }
}

fn check_feature_crs(sources: &SourceSet, features: &FeatureCollection) -> Result<()> {
    match sources.crs() {
        Some(crs) if !crs.is_equivalent(&features.crs) => Err(ExtractError::CrsMismatch {
            expected: crs.identifier(),
            found: features.crs.identifier(),
            context: "the feature collection".to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            warn!(
                "no raster source declares a CRS, features in {} are used as is",
                features.crs
            );
            Ok(())
        }
    }
}

/// Read and fuse every unit on the worker pool and aggregate the results
/// on the calling thread.
fn run_units(
    sources: &SourceSet,
    plan: &Plan,
    config: &ExtractConfig,
    cancel: &CancellationToken,
    ctx: &RunContext<'_>,
    assembler: &mut Assembler,
) -> Result<()> {
    let stop = AtomicBool::new(false);
    let is_stopped = || cancel.is_cancelled() || stop.load(Ordering::Relaxed);

    let mode = ProcessingMode::from_concurrency(plan.concurrency);
    let (tx, rx) = bounded::<UnitOutcome>(plan.concurrency.max(1));
    let units = &plan.units;
    let threshold = config.threshold;

    thread::scope(|scope| -> Result<()> {
        let producer = scope.spawn(move || {
            mode.par_for_each(0..units.len(), |i| {
                if is_stopped() {
                    return;
                }
                match read_unit(sources, &units[i], threshold, &is_stopped) {
                    Ok(None) => {}
                    Ok(Some(block)) => {
                        let _ = tx.send(UnitOutcome {
                            unit: i,
                            result: Ok(block),
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(UnitOutcome {
                            unit: i,
                            result: Err(e),
                        });
                    }
                }
            })
        });

        let consumed = consume(rx, ctx, assembler);
        if consumed.is_err() {
            stop.store(true, Ordering::SeqCst);
        }

        match producer.join() {
            Ok(pool) => pool?,
            Err(panic) => std::panic::resume_unwind(panic),
        }
        consumed
    })
}

/// Read every source for one unit and fuse the blocks; `Ok(None)` when the
/// run was stopped in between
fn read_unit(
    sources: &SourceSet,
    unit: &WorkUnit,
    threshold: Option<f64>,
    is_stopped: &dyn Fn() -> bool,
) -> Result<Option<FusedBlock>> {
    let mut blocks = Vec::with_capacity(sources.len());
    for (i, source) in sources.sources().iter().enumerate() {
        if is_stopped() {
            return Ok(None);
        }
        let block = match sources.source_window(i, &unit.window) {
            Some(window) => WindowedReader::new(source, threshold).read(&window)?,
            None => None,
        };
        blocks.push(block);
    }
    sources.fuse(&unit.window, blocks).map(Some)
}

fn consume(
    rx: Receiver<UnitOutcome>,
    ctx: &RunContext<'_>,
    assembler: &mut Assembler,
) -> Result<()> {
    for outcome in rx {
        let unit = &ctx.units[outcome.unit];
        match outcome.result {
            Ok(block) => {
                debug!(
                    "unit {}: aggregating {} feature(s) from {}",
                    unit.index,
                    unit.features.len(),
                    block.window()
                );
                for &slot in &unit.features {
                    assembler.insert(slot, ctx.feature_record(slot, &block))?;
                }
            }
            Err(e) if ctx.fail_fast => return Err(e),
            Err(e) => {
                warn!("unit {} failed: {}", unit.index, e);
                let reason = e.to_string();
                for &slot in &unit.features {
                    assembler.insert(
                        slot,
                        ctx.null_record(slot, FeatureStatus::RasterIo(reason.clone())),
                    )?;
                }
            }
        }
    }
    Ok(())
}
