//! GeoJSON feature collection loader

use anyhow::{anyhow, bail, Context, Result};
use geo_types::Geometry;
use geojson::feature::Id;
use geojson::GeoJson;
use phytostat_core::{AttributeValue, CRS, Feature, FeatureCollection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Read a GeoJSON `FeatureCollection`.
///
/// The identifier comes from the `id_field` property, falling back to the
/// feature's `id` member; the property is not repeated as an attribute.
/// `crs` overrides the collection's `crs` member; without either the
/// coordinates are taken as WGS 84.
pub fn read_features(path: &Path, id_field: &str, crs: Option<CRS>) -> Result<FeatureCollection> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let doc: GeoJson = text
        .parse()
        .with_context(|| format!("{} is not valid GeoJSON", path.display()))?;

    let collection = parse_collection(doc, id_field, crs)?;
    info!(
        "Features: {} from {} ({})",
        collection.len(),
        path.display(),
        collection.crs
    );
    Ok(collection)
}

fn parse_collection(doc: GeoJson, id_field: &str, crs: Option<CRS>) -> Result<FeatureCollection> {
    let GeoJson::FeatureCollection(fc) = doc else {
        bail!("Expected a GeoJSON FeatureCollection");
    };

    let declared = fc.foreign_members.as_ref().and_then(|m| m.get("crs"));
    let crs = match (crs, declared) {
        (Some(crs), _) => crs,
        (None, Some(member)) => parse_crs_member(member)?,
        (None, None) => {
            warn!("No CRS declared for the features, assuming WGS 84");
            CRS::wgs84()
        }
    };

    let features = fc
        .features
        .into_iter()
        .enumerate()
        .map(|(i, item)| parse_feature(item, id_field).with_context(|| format!("Feature #{}", i + 1)))
        .collect::<Result<Vec<_>>>()?;

    Ok(FeatureCollection::from_features(crs, features))
}

/// `{"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::32619"}}`
fn parse_crs_member(member: &Value) -> Result<CRS> {
    let name = member
        .pointer("/properties/name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Unsupported crs member: {member}"))?;

    name.parse::<CRS>()
        .with_context(|| format!("Unrecognised CRS name '{name}'"))
}

fn parse_feature(item: geojson::Feature, id_field: &str) -> Result<Feature> {
    let mut properties = item.properties.unwrap_or_default();

    let id = match (properties.remove(id_field), item.id) {
        (Some(value), _) => id_string(&value)?,
        (None, Some(Id::String(s))) if !s.is_empty() => s,
        (None, Some(Id::Number(n))) => n.to_string(),
        (None, _) => bail!("No '{id_field}' property and no id"),
    };

    let geometry = item
        .geometry
        .ok_or_else(|| anyhow!("Feature '{id}' has no geometry"))?;
    let geometry = convert_geometry(geometry).with_context(|| format!("Feature '{id}'"))?;

    let mut feature = Feature::new(id, geometry);
    feature.properties = properties
        .into_iter()
        .map(|(k, v)| (k, attribute(v)))
        .collect::<BTreeMap<_, _>>();
    Ok(feature)
}

fn id_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => bail!("Invalid feature id {other}"),
    }
}

fn attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AttributeValue::Int(i),
            None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => AttributeValue::String(s),
        nested => AttributeValue::String(nested.to_string()),
    }
}

/// Only areal features and points can be rasterized into a pixel mask
fn convert_geometry(geometry: geojson::Geometry) -> Result<Geometry<f64>> {
    let geometry = Geometry::<f64>::try_from(geometry)?;
    match geometry {
        Geometry::Point(_) | Geometry::Polygon(_) | Geometry::MultiPolygon(_) => Ok(geometry),
        other => bail!("Unsupported geometry type {}", geometry_name(&other)),
    }
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}
