//! Ordered result assembly

use phytostat_core::{AttributeValue, FeatureId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};

use crate::config::Statistic;
use crate::error::{ExtractError, FeatureStatus, Result};
use crate::stats::BandStatistics;

/// One output row: the statistics of one feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRecord {
    pub id: FeatureId,
    pub status: FeatureStatus,
    /// Names of the fused sources
    pub raster_source: String,
    /// Per-band statistics in fused band order
    pub bands: Vec<BandStatistics>,
    /// Pass-through feature attributes
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl StatRecord {
    /// A row whose statistics are all null
    pub fn null(
        id: FeatureId,
        status: FeatureStatus,
        raster_source: &str,
        labels: &[String],
        statistics: &[Statistic],
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            id,
            status,
            raster_source: raster_source.to_string(),
            bands: labels
                .iter()
                .map(|l| BandStatistics::empty(l.clone(), statistics))
                .collect(),
            attributes,
        }
    }

    /// Statistics of a band by label
    pub fn band(&self, label: &str) -> Option<&BandStatistics> {
        self.bands.iter().find(|b| b.label == label)
    }
}

/// Collects records arriving in any order and returns them in feature input
/// order.
#[derive(Debug)]
pub struct Assembler {
    ids: Vec<FeatureId>,
    rows: Vec<Option<StatRecord>>,
    filled: usize,
}

impl Assembler {
    /// Fails with `DuplicateFeatureId` when an identifier repeats
    pub fn new(ids: Vec<FeatureId>) -> Result<Self> {
        {
            let mut seen = HashSet::with_capacity(ids.len());
            if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(ExtractError::DuplicateFeatureId(dup.clone()));
            }
        }
        let rows = vec![None; ids.len()];
        Ok(Self {
            ids,
            rows,
            filled: 0,
        })
    }

    /// Store the record of the feature at `slot`; a slot accepts one record
    pub fn insert(&mut self, slot: usize, record: StatRecord) -> Result<()> {
        let Some(row) = self.rows.get_mut(slot) else {
            return Err(ExtractError::InvalidConfig(format!(
                "record for unknown feature slot {slot}"
            )));
        };
        if row.is_some() {
            return Err(ExtractError::DuplicateFeatureId(record.id));
        }
        *row = Some(record);
        self.filled += 1;
        Ok(())
    }

    pub fn is_filled(&self, slot: usize) -> bool {
        self.rows.get(slot).is_some_and(Option::is_some)
    }

    /// Number of features still without a record
    pub fn remaining(&self) -> usize {
        self.rows.len() - self.filled
    }

    /// Records in input order; `fill` builds the rows never inserted
    pub fn finish<F>(self, mut fill: F) -> Vec<StatRecord>
    where
        F: FnMut(usize, FeatureId) -> StatRecord,
    {
        self.rows
            .into_iter()
            .zip(self.ids)
            .enumerate()
            .map(|(slot, (row, id))| row.unwrap_or_else(|| fill(slot, id)))
            .collect()
    }
}

/// Tabular extraction result, one record per input feature in input order.
#[derive(Debug, Clone, Serialize)]
pub struct ResultTable {
    /// Name of the identifier column
    pub id_column: String,
    pub statistics: Vec<Statistic>,
    pub band_labels: Vec<String>,
    pub attribute_names: Vec<String>,
    pub records: Vec<StatRecord>,
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatRecord> {
        self.records.iter()
    }

    /// Record of a feature by identifier
    pub fn get(&self, id: &str) -> Option<&StatRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn with_id_column(mut self, name: impl Into<String>) -> Self {
        self.id_column = name.into();
        self
    }

    /// Records per status code
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.status.code()).or_insert(0) += 1;
        }
        counts
    }

    /// Column names: identifier, attributes, `raster_source`, `status`, then
    /// `<label>_<stat>` for every band and statistic
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![self.id_column.clone()];
        columns.extend(self.attribute_names.iter().cloned());
        columns.push("raster_source".to_string());
        columns.push("status".to_string());
        for label in &self.band_labels {
            for stat in &self.statistics {
                columns.push(format!("{label}_{}", stat.column_suffix()));
            }
        }
        columns
    }

    /// Write as CSV with a header row. Null statistics and missing
    /// attributes are empty fields; raw pixel values are not written.
    pub fn write_csv<W: Write>(&self, out: W) -> io::Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(self.columns())?;

        for record in &self.records {
            let attributes = self.attribute_names.iter().map(|name| {
                record
                    .attributes
                    .get(name)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            });
            let statistics = record.bands.iter().flat_map(|band| {
                self.statistics
                    .iter()
                    .map(move |stat| band.value(stat).map(|v| v.to_string()).unwrap_or_default())
            });

            let mut row = vec![record.id.clone()];
            row.extend(attributes);
            row.push(record.raster_source.clone());
            row.push(record.status.to_string());
            row.extend(statistics);
            writer.write_record(&row)?;
        }
        writer.flush()
    }
}
