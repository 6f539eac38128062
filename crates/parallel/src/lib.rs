//! # phytostat parallel
//!
//! Parallel execution helpers for the extraction engine.
//!
//! This crate provides:
//! - `ProcessingMode`: sequential or rayon-backed execution bounded by a
//!   thread count
//! - `TileGrid`: the square tile partition used by tiled extraction plans

pub mod strategy;
pub mod tiled;

pub use strategy::{num_cpus, ParallelStrategy, PoolBuildError, ProcessingMode};
pub use tiled::{Tile, TileGrid};
