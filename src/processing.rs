use crate::config::ProcessingConfig;
use crate::error::{PipelineError, Result};
use crate::join::{count_by_region, spatial_join};
use crate::types::{PointFeature, Region, Rgba, VectorLayer};
use geo::algorithm::centroid::Centroid;
use geo::{Geometry, MultiPolygon};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Output of the region-count pipeline.
#[derive(Debug, Clone)]
pub struct RegionSummary {
    pub regions: Vec<Region>,
    pub matched: usize,
    pub unmatched: usize,
    pub max_count: u32,
}

/// Builds the region set from a boundary layer keyed by `name_column`.
/// Features sharing a name are merged into one multi-polygon; non-polygon
/// features are skipped.
pub fn regions_from_layer(layer: &VectorLayer, name_column: &str) -> Result<Vec<Region>> {
    let mut order: Vec<String> = Vec::new();
    let mut parts: HashMap<String, Vec<geo::Polygon<f64>>> = HashMap::new();

    for (i, feature) in layer.features.iter().enumerate() {
        let name = match feature.properties.get(name_column) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(PipelineError::DegenerateInput(format!(
                    "boundary feature {} has no '{}' value",
                    i, name_column
                )))
            }
        };

        let polygons = match &feature.geometry {
            Geometry::Polygon(p) => vec![p.clone()],
            Geometry::MultiPolygon(mp) => mp.0.clone(),
            _ => {
                warn!(region = %name, "Skipping non-polygon boundary feature");
                continue;
            }
        };

        if !parts.contains_key(&name) {
            order.push(name.clone());
        }
        parts.entry(name).or_default().extend(polygons);
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let geometry = MultiPolygon::new(parts.remove(&name).unwrap_or_default());
            Region {
                name,
                geometry,
                count: 0,
                elevation: 0.0,
                centroid_lon: 0.0,
                centroid_lat: 0.0,
                column_color: [0, 0, 0, 0],
            }
        })
        .collect())
}

/// `count / max(count) * max_height` for every region. An all-zero (or
/// empty) input has no meaningful scale and is rejected.
pub fn scale_heights(counts: &[u32], max_height: f64) -> Result<Vec<f64>> {
    let max = counts.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return Err(PipelineError::DegenerateInput(
            "maximum region count is 0, cannot scale heights".into(),
        ));
    }
    Ok(counts
        .iter()
        .map(|&c| c as f64 / max as f64 * max_height)
        .collect())
}

/// Red-to-blue ramp: red grows and blue shrinks with `count / max_count`.
pub fn column_color(count: u32, max_count: u32) -> Rgba {
    let ratio = if max_count == 0 {
        0.0
    } else {
        (count as f64 / max_count as f64).clamp(0.0, 1.0)
    };
    let channel = |v: f64| v.clamp(0.0, 255.0) as u8;
    [channel(255.0 * ratio), 50, channel(255.0 * (1.0 - ratio)), 200]
}

/// Writes each region's centroid into `centroid_lon` / `centroid_lat`.
pub fn project_centroids(regions: &mut [Region]) -> Result<()> {
    for region in regions.iter_mut() {
        let centroid = region.geometry.centroid().ok_or_else(|| {
            PipelineError::DegenerateInput(format!("region '{}' has an empty geometry", region.name))
        })?;
        region.centroid_lon = centroid.x();
        region.centroid_lat = centroid.y();
    }
    Ok(())
}

/// Join, aggregate, and enrich `regions` in place with count, centroid,
/// elevation and column color.
pub fn run_region_pipeline(
    config: &ProcessingConfig,
    mut regions: Vec<Region>,
    points: &[PointFeature],
) -> Result<RegionSummary> {
    info!(regions = regions.len(), points = points.len(), "Joining points to regions");

    let joined = spatial_join(points, &regions);
    let matched = joined.iter().filter(|j| j.region.is_some()).count();
    let unmatched = joined.len() - matched;
    if matched == 0 {
        return Err(PipelineError::EmptyJoinResult { regions: regions.len() });
    }
    if unmatched > 0 {
        warn!(unmatched, "Points outside every region were left out of the counts");
    }

    let counts: Vec<u32> = count_by_region(&joined, &regions).into_iter().map(|(_, c)| c).collect();
    let max_count = counts.iter().copied().max().unwrap_or(0);
    let elevations = scale_heights(&counts, config.max_height)?;

    project_centroids(&mut regions)?;
    for ((region, count), elevation) in regions.iter_mut().zip(counts).zip(elevations) {
        region.count = count;
        region.elevation = elevation;
        region.column_color = column_color(count, max_count);
    }

    info!(matched, unmatched, max_count, "Region counts ready");
    Ok(RegionSummary { regions, matched, unmatched, max_count })
}
