//! # phytostat extract
//!
//! Per-feature zonal statistics over one or more co-registered rasters.
//!
//! ## Pipeline
//!
//! - **fusion**: register sources, pick the reference grid, resample onto it
//! - **index**: R-tree over feature bounds
//! - **planner**: choose whole-read, tiled or per-feature reads under a memory budget
//! - **reader**: windowed reads and validity masks
//! - **stats**: per-band aggregation over the valid pixels of a feature
//! - **assemble**: one record per feature, in input order
//! - **engine**: the concurrent run tying it together

pub mod assemble;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod index;
pub mod planner;
pub mod reader;
pub mod stats;

pub use assemble::{Assembler, ResultTable, StatRecord};
pub use cancel::CancellationToken;
pub use config::{ExtractConfig, Statistic, TileMode, DEFAULT_MEMORY_BUDGET, DEFAULT_TILE_SIZE};
pub use engine::{extract, plan_extraction};
pub use error::{ExtractError, FeatureStatus, Result};
pub use fusion::{FusedBlock, ReferenceGrid, RegisteredSource, Resampling, SourceKind, SourceSet};
pub use index::GeometryIndex;
pub use planner::{plan, Plan, PlanRequest, Strategy, WorkUnit};
pub use reader::{rasterize, PixelBlock, WindowedReader};
pub use stats::{aggregate, percentile, BandStatistics, RunningStats};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::assemble::{ResultTable, StatRecord};
    pub use crate::cancel::CancellationToken;
    pub use crate::config::{ExtractConfig, Statistic, TileMode};
    pub use crate::engine::{extract, plan_extraction};
    pub use crate::error::{ExtractError, FeatureStatus};
    pub use crate::fusion::{RegisteredSource, Resampling, SourceKind, SourceSet};
    pub use phytostat_core::prelude::*;
}
