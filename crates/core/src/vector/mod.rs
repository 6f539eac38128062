//! Vector feature records
//!
//! Features arrive from an external vector loader already validated and in a
//! declared CRS. They are immutable once ingested: the engine only reads the
//! geometry and copies the attributes into the output rows.

use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::crs::CRS;

/// Stable, unique feature identifier
pub type FeatureId = String;

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => Ok(()),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::String(v) => f.write_str(v),
        }
    }
}

/// A geographic feature with geometry and pass-through attributes
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Geometry<f64>,
    pub properties: BTreeMap<String, AttributeValue>,
}

impl Feature {
    /// Create a new feature with no attributes
    pub fn new(id: impl Into<FeatureId>, geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            id: id.into(),
            geometry: geometry.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_property(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Get an attribute
    pub fn get_property(&self, key: &str) -> Option<&AttributeValue> {
        self.properties.get(key)
    }
}

/// Ordered collection of features sharing one CRS.
///
/// The input order is significant: result rows come back in this order.
#[derive(Debug, Clone)]
pub struct FeatureCollection {
    pub crs: CRS,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(crs: CRS) -> Self {
        Self {
            crs,
            features: Vec::new(),
        }
    }

    pub fn from_features(crs: CRS, features: Vec<Feature>) -> Self {
        Self { crs, features }
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Names of all attributes present on at least one feature, sorted
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .features
            .iter()
            .flat_map(|f| f.properties.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
