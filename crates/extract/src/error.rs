//! Error types for the extraction engine.

use phytostat_core::FeatureId;
use phytostat_parallel::PoolBuildError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors produced while setting up or running an extraction.
///
/// Setup errors (CRS mismatch, band collisions, unsatisfiable memory budget,
/// invalid geometry) are always returned before any pixel is read.
/// `WindowOutOfBounds` and `RasterIo` are per-feature outcomes: they are
/// recorded as a [`FeatureStatus`] unless `fail_fast` is set.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid geometry for feature '{id}': {reason}")]
    InvalidGeometry { id: FeatureId, reason: String },

    #[error("CRS mismatch: rasters use {expected}, {context} uses {found}")]
    CrsMismatch {
        expected: String,
        found: String,
        context: String,
    },

    #[error("feature '{id}' does not intersect the raster extent")]
    WindowOutOfBounds { id: FeatureId },

    #[error("read of {window} from '{source_name}' failed: {reason}")]
    RasterIo {
        source_name: String,
        window: String,
        reason: String,
    },

    #[error("band label '{label}' is registered by both '{first}' and '{second}'")]
    BandCollision {
        label: String,
        first: String,
        second: String,
    },

    #[error("memory budget of {budget} bytes cannot hold {what} ({required} bytes)")]
    MemoryBudgetExceeded {
        budget: u64,
        required: u64,
        what: String,
    },

    #[error("duplicate feature id: {0}")]
    DuplicateFeatureId(FeatureId),

    #[error("no raster sources registered")]
    NoSources,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] PoolBuildError),

    #[error("core error: {0}")]
    Core(#[from] phytostat_core::Error),
}

/// Result alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Outcome attached to every output row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// At least one valid pixel was aggregated
    Ok,
    /// The feature footprint held no valid pixel; statistics are null
    NoValidPixels,
    /// The feature bounds do not touch the raster extent
    WindowOutOfBounds,
    /// The window read failed
    RasterIo(String),
    /// The run was cancelled before this feature was processed
    Cancelled,
}

impl FeatureStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FeatureStatus::Ok)
    }

    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FeatureStatus::Ok => "ok",
            FeatureStatus::NoValidPixels => "no_valid_pixels",
            FeatureStatus::WindowOutOfBounds => "window_out_of_bounds",
            FeatureStatus::RasterIo(_) => "raster_io",
            FeatureStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureStatus::RasterIo(reason) => write!(f, "raster_io: {reason}"),
            other => f.write_str(other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(FeatureStatus::Ok.to_string(), "ok");
        assert_eq!(
            FeatureStatus::RasterIo("corrupt block".into()).to_string(),
            "raster_io: corrupt block"
        );
        assert!(!FeatureStatus::Cancelled.is_ok());
    }

    #[test]
    fn test_core_error_converts() {
        let err: ExtractError = phytostat_core::Error::BandOutOfRange { band: 4, count: 3 }.into();
        assert!(matches!(err, ExtractError::Core(_)));
        assert_eq!(
            err.to_string(),
            "core error: band 4 requested from a 3-band raster"
        );
    }
}
