//! Extraction configuration

use phytostat_parallel::num_cpus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ExtractError, Result};

/// Default memory budget: 512 MiB
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// Default upper bound on the side of a square tile, in pixels
pub const DEFAULT_TILE_SIZE: usize = 512;

/// How the planner groups features into read windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileMode {
    /// Whole read when the raster fits the budget, tiles otherwise
    #[default]
    Auto,
    /// One read window per feature
    PerFeature,
    /// Always tile
    Tiled,
}

impl FromStr for TileMode {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(TileMode::Auto),
            "per_feature" => Ok(TileMode::PerFeature),
            "tiled" => Ok(TileMode::Tiled),
            other => Err(ExtractError::InvalidConfig(format!(
                "unknown tile mode '{other}' (expected auto, per_feature or tiled)"
            ))),
        }
    }
}

impl fmt::Display for TileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TileMode::Auto => "auto",
            TileMode::PerFeature => "per_feature",
            TileMode::Tiled => "tiled",
        })
    }
}

/// A per-band summary statistic.
///
/// Parsed from and serialized as short names: `mean`, `std`, `min`, `max`,
/// `count`, `median`, `p90`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Statistic {
    Mean,
    /// Population standard deviation
    Std,
    Min,
    Max,
    /// Number of valid pixels
    Count,
    Median,
    /// Percentile in `[0, 100]`, linear interpolation between closest ranks
    Percentile(f64),
}

impl Statistic {
    /// The statistics computed when none are configured
    pub fn defaults() -> Vec<Statistic> {
        vec![
            Statistic::Mean,
            Statistic::Std,
            Statistic::Min,
            Statistic::Max,
            Statistic::Count,
        ]
    }

    /// Suffix used in output column names (`<label>_<suffix>`)
    pub fn column_suffix(&self) -> String {
        match self {
            Statistic::Mean => "mean".to_string(),
            Statistic::Std => "sd".to_string(),
            Statistic::Min => "min".to_string(),
            Statistic::Max => "max".to_string(),
            Statistic::Count => "count".to_string(),
            Statistic::Median => "med".to_string(),
            Statistic::Percentile(p) => format_percentile(*p),
        }
    }

    /// Percentile rank when this statistic needs the sorted value set
    pub fn rank(&self) -> Option<f64> {
        match self {
            Statistic::Median => Some(50.0),
            Statistic::Percentile(p) => Some(*p),
            _ => None,
        }
    }
}

fn format_percentile(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{}", p as u32)
    } else {
        format!("p{p}")
    }
}

impl FromStr for Statistic {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        let stat = match name.as_str() {
            "mean" | "avg" => Statistic::Mean,
            "std" | "sd" | "stdev" => Statistic::Std,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "count" => Statistic::Count,
            "median" | "med" => Statistic::Median,
            _ => {
                let value = name
                    .strip_prefix("percentile(")
                    .and_then(|v| v.strip_suffix(')'))
                    .or_else(|| name.strip_prefix('p'))
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| {
                        ExtractError::InvalidConfig(format!("unknown statistic '{s}'"))
                    })?;
                if !(0.0..=100.0).contains(&value) {
                    return Err(ExtractError::InvalidConfig(format!(
                        "percentile {value} outside [0, 100]"
                    )));
                }
                Statistic::Percentile(value)
            }
        };
        Ok(stat)
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Mean => f.write_str("mean"),
            Statistic::Std => f.write_str("std"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Count => f.write_str("count"),
            Statistic::Median => f.write_str("median"),
            Statistic::Percentile(p) => f.write_str(&format_percentile(*p)),
        }
    }
}

impl TryFrom<String> for Statistic {
    type Error = ExtractError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Statistic> for String {
    fn from(value: Statistic) -> Self {
        value.to_string()
    }
}

/// Run-wide extraction options.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// changes:
///
/// ```
/// use phytostat_extract::{ExtractConfig, TileMode};
///
/// let config: ExtractConfig =
///     serde_json::from_str(r#"{"tile_mode": "tiled", "statistics": ["mean", "p90"]}"#).unwrap();
/// assert_eq!(config.tile_mode, TileMode::Tiled);
/// assert_eq!(config.statistics.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub tile_mode: TileMode,
    /// Upper bound on pixel bytes held by concurrent reads
    pub memory_budget_bytes: u64,
    /// Statistics computed per band, in output column order
    pub statistics: Vec<Statistic>,
    /// Abort on the first per-feature error instead of recording it
    pub fail_fast: bool,
    /// Maximum number of work units processed at once
    pub concurrency_limit: usize,
    /// Upper bound on the tile side in pixels; the budget may shrink it
    pub tile_size: Option<usize>,
    /// A pixel is valid only if every band value is strictly greater
    pub threshold: Option<f64>,
    /// Keep the valid pixel values of every band in each record
    pub return_raw: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            tile_mode: TileMode::Auto,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            statistics: Statistic::defaults(),
            fail_fast: false,
            concurrency_limit: num_cpus(),
            tile_size: Some(DEFAULT_TILE_SIZE),
            threshold: None,
            return_raw: false,
        }
    }
}

impl ExtractConfig {
    pub fn with_tile_mode(mut self, mode: TileMode) -> Self {
        self.tile_mode = mode;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_statistics(mut self, statistics: Vec<Statistic>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_tile_size(mut self, tile_size: Option<usize>) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_threshold(mut self, threshold: Option<f64>) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_return_raw(mut self, return_raw: bool) -> Self {
        self.return_raw = return_raw;
        self
    }

    /// Check option ranges and drop repeated statistics (first occurrence
    /// wins).
    pub fn validated(&self) -> Result<ExtractConfig> {
        if self.memory_budget_bytes == 0 {
            return Err(ExtractError::InvalidConfig(
                "memory_budget_bytes must be positive".into(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(ExtractError::InvalidConfig(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.tile_size == Some(0) {
            return Err(ExtractError::InvalidConfig("tile_size must be at least 1".into()));
        }
        if let Some(t) = self.threshold
            && !t.is_finite()
        {
            return Err(ExtractError::InvalidConfig(format!("threshold {t} is not finite")));
        }
        if self.statistics.is_empty() {
            return Err(ExtractError::InvalidConfig("no statistics requested".into()));
        }
        if let Some(p) = self
            .statistics
            .iter()
            .filter_map(Statistic::rank)
            .find(|p| !(0.0..=100.0).contains(p))
        {
            return Err(ExtractError::InvalidConfig(format!(
                "percentile {p} outside [0, 100]"
            )));
        }

        let mut statistics: Vec<Statistic> = Vec::with_capacity(self.statistics.len());
        for stat in &self.statistics {
            if !statistics.contains(stat) {
                statistics.push(*stat);
            }
        }

        Ok(ExtractConfig {
            statistics,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statistics() {
        assert_eq!("mean".parse::<Statistic>().unwrap(), Statistic::Mean);
        assert_eq!("SD".parse::<Statistic>().unwrap(), Statistic::Std);
        assert_eq!("med".parse::<Statistic>().unwrap(), Statistic::Median);
        assert_eq!("p90".parse::<Statistic>().unwrap(), Statistic::Percentile(90.0));
        assert_eq!(
            "percentile(12.5)".parse::<Statistic>().unwrap(),
            Statistic::Percentile(12.5)
        );
        assert!("p101".parse::<Statistic>().is_err());
        assert!("mode".parse::<Statistic>().is_err());
    }

    #[test]
    fn test_column_suffixes() {
        assert_eq!(Statistic::Std.column_suffix(), "sd");
        assert_eq!(Statistic::Median.column_suffix(), "med");
        assert_eq!(Statistic::Percentile(25.0).column_suffix(), "p25");
        assert_eq!(Statistic::Percentile(2.5).column_suffix(), "p2.5");
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: ExtractConfig = serde_json::from_str(
            r#"{"tile_mode": "per_feature", "memory_budget_bytes": 1024, "statistics": ["mean", "median"]}"#,
        )
        .unwrap();
        assert_eq!(config.tile_mode, TileMode::PerFeature);
        assert_eq!(config.memory_budget_bytes, 1024);
        assert_eq!(config.statistics, vec![Statistic::Mean, Statistic::Median]);
        assert_eq!(config.tile_size, Some(DEFAULT_TILE_SIZE));
        assert!(!config.fail_fast);
    }

    #[test]
    fn test_config_round_trips_statistics_as_strings() {
        let config = ExtractConfig::default().with_statistics(vec![Statistic::Percentile(75.0)]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""statistics":["p75"]"#));
    }

    #[test]
    fn test_validated_rejects_bad_values_and_dedupes() {
        assert!(ExtractConfig::default().with_concurrency(0).validated().is_err());
        assert!(ExtractConfig::default().with_memory_budget(0).validated().is_err());
        assert!(ExtractConfig::default().with_tile_size(Some(0)).validated().is_err());
        assert!(
            ExtractConfig::default()
                .with_threshold(Some(f64::NAN))
                .validated()
                .is_err()
        );

        let config = ExtractConfig::default()
            .with_statistics(vec![Statistic::Mean, Statistic::Max, Statistic::Mean])
            .validated()
            .unwrap();
        assert_eq!(config.statistics, vec![Statistic::Mean, Statistic::Max]);
    }
}
