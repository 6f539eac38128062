//! Spatial index over feature bounding boxes.
//!
//! Uses an R-tree so that the planner can find the features intersecting a
//! tile in O(log n + k).

use geo::{Area, BoundingRect, CoordsIter};
use geo_types::Geometry;
use phytostat_core::{BBox, Feature};
use rstar::{AABB, RTree, RTreeObject};

use crate::error::{ExtractError, Result};

/// A feature's bounding box and its position in the input collection.
#[derive(Clone, Debug)]
struct IndexedFeature {
    slot: usize,
    bounds: BBox,
}

impl RTreeObject for IndexedFeature {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_x, self.bounds.min_y],
            [self.bounds.max_x, self.bounds.max_y],
        )
    }
}

/// Read-only spatial index over a feature slice.
///
/// Slots are positions in the slice passed to [`build`](GeometryIndex::build)
/// and are what the rest of the engine uses to refer to features.
///
/// # Example
/// ```
/// use geo_types::polygon;
/// use phytostat_core::{BBox, Feature};
/// use phytostat_extract::GeometryIndex;
///
/// let features = vec![
///     Feature::new("a", polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0)]),
///     Feature::new("b", polygon![(x: 10.0, y: 10.0), (x: 12.0, y: 10.0), (x: 12.0, y: 12.0)]),
/// ];
/// let index = GeometryIndex::build(&features).unwrap();
///
/// let hits = index.query(&BBox::new(1.0, 1.0, 5.0, 5.0));
/// assert_eq!(hits.len(), 1);
/// assert_eq!(hits[0].id, "a");
/// ```
pub struct GeometryIndex<'a> {
    features: &'a [Feature],
    bounds: Vec<BBox>,
    tree: RTree<IndexedFeature>,
}

impl<'a> GeometryIndex<'a> {
    /// Validate every geometry and bulk-load the tree
    pub fn build(features: &'a [Feature]) -> Result<Self> {
        let bounds = features
            .iter()
            .map(feature_bounds)
            .collect::<Result<Vec<_>>>()?;

        let indexed: Vec<IndexedFeature> = bounds
            .iter()
            .enumerate()
            .map(|(slot, b)| IndexedFeature { slot, bounds: *b })
            .collect();

        Ok(Self {
            features,
            bounds,
            tree: RTree::bulk_load(indexed),
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Feature at a slot
    pub fn feature(&self, slot: usize) -> &'a Feature {
        &self.features[slot]
    }

    pub fn features(&self) -> &'a [Feature] {
        self.features
    }

    /// Bounding box of the feature at a slot
    pub fn bounds(&self, slot: usize) -> BBox {
        self.bounds[slot]
    }

    /// Slots of the features whose bounds intersect `bbox` (touching edges
    /// included), in input order
    pub fn query_slots(&self, bbox: &BBox) -> Vec<usize> {
        let envelope = AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y]);
        let mut slots: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|f| f.slot)
            .collect();
        slots.sort_unstable();
        slots
    }

    /// Features whose bounds intersect `bbox`, in input order
    pub fn query(&self, bbox: &BBox) -> Vec<&'a Feature> {
        self.query_slots(bbox)
            .into_iter()
            .map(|slot| &self.features[slot])
            .collect()
    }
}

/// Bounding box of a supported, non-degenerate geometry
fn feature_bounds(feature: &Feature) -> Result<BBox> {
    let invalid = |reason: &str| ExtractError::InvalidGeometry {
        id: feature.id.clone(),
        reason: reason.to_string(),
    };

    let geometry = &feature.geometry;
    let polygonal = match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => false,
        Geometry::Polygon(_)
        | Geometry::MultiPolygon(_)
        | Geometry::Rect(_)
        | Geometry::Triangle(_) => true,
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
            return Err(invalid("line geometries are not supported"));
        }
        Geometry::GeometryCollection(_) => {
            return Err(invalid("geometry collections are not supported"));
        }
    };

    if geometry.coords_iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(invalid("non-finite coordinate"));
    }
    let rect = geometry
        .bounding_rect()
        .ok_or_else(|| invalid("empty geometry"))?;
    if polygonal && geometry.unsigned_area() <= 0.0 {
        return Err(invalid("polygon has zero area"));
    }

    Ok(BBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
}
