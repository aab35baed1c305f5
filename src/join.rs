use crate::types::{PointFeature, Region};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use tracing::debug;

// Envelope of a region, pointing back into the region slice.
struct RegionEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Result row of the left join: the point at `point_index` and the name of
/// the region containing it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedPoint {
    pub point_index: usize,
    pub region: Option<String>,
}

/// R-tree of region envelopes for point lookups against the region slice it
/// was built from.
pub struct RegionIndex {
    tree: RTree<RegionEnvelope>,
}

impl RegionIndex {
    pub fn new(regions: &[Region]) -> Self {
        let items: Vec<RegionEnvelope> = regions.iter().enumerate()
            .filter_map(|(index, region)| {
                let rect = region.geometry.bounding_rect()?;
                Some(RegionEnvelope {
                    index,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();
        debug!(regions = items.len(), "Built region index");
        Self { tree: RTree::bulk_load(items) }
    }

    /// Index of the region strictly containing the point. Points on a shared
    /// border belong to neither side. If regions overlap, the one listed
    /// first in the boundary dataset wins.
    pub fn locate(&self, regions: &[Region], lon: f64, lat: f64) -> Option<usize> {
        let point = geo::Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| regions[candidate.index].geometry.contains(&point))
            .map(|candidate| candidate.index)
            .min()
    }
}

/// Left join of points onto regions with a point-within-polygon predicate.
/// The output has exactly one row per input point, in input order.
pub fn spatial_join(points: &[PointFeature], regions: &[Region]) -> Vec<JoinedPoint> {
    let index = RegionIndex::new(regions);

    points.par_iter().enumerate().map(|(point_index, feature)| {
        let region = index
            .locate(regions, feature.point.x(), feature.point.y())
            .map(|i| regions[i].name.clone());
        JoinedPoint { point_index, region }
    }).collect()
}

/// Count of points per region name, one entry per region in boundary order.
/// Regions nothing fell into are kept with a count of 0.
pub fn count_by_region(joined: &[JoinedPoint], regions: &[Region]) -> Vec<(String, u32)> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for row in joined {
        if let Some(name) = &row.region {
            *counts.entry(name.as_str()).or_insert(0) += 1;
        }
    }

    regions.iter()
        .map(|region| (region.name.clone(), counts.get(region.name.as_str()).copied().unwrap_or(0)))
        .collect()
}
