use crate::config::PrepareConfig;
use crate::error::{PipelineError, Result};
use crate::types::{Feature, VectorLayer};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::info;

/// Rewrites the group column through the alias table (e.g. "中正" -> "中正區").
pub fn apply_aliases(layer: &mut VectorLayer, column: &str, aliases: &HashMap<String, String>) -> usize {
    let mut replaced = 0;
    for feature in &mut layer.features {
        if let Some(Value::String(current)) = feature.properties.get_mut(column) {
            if let Some(canonical) = aliases.get(current.as_str()) {
                *current = canonical.clone();
                replaced += 1;
            }
        }
    }
    replaced
}

/// Drops every attribute not listed in `keep`.
pub fn keep_columns(layer: &mut VectorLayer, keep: &[String]) {
    for feature in &mut layer.features {
        feature.properties.retain(|name, _| keep.iter().any(|k| k == name));
    }
}

fn group_key(feature: &Feature, column: &str) -> Option<String> {
    match feature.properties.get(column)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Samples each group in proportion to its size: the largest group keeps
/// `cap` features, a group half its size keeps `cap / 2`, never more than it
/// has. Features without a group value are dropped. Survivors keep their
/// original order.
pub fn proportional_sample(layer: &VectorLayer, column: &str, cap: usize, seed: u64) -> VectorLayer {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, feature) in layer.features.iter().enumerate() {
        if let Some(key) = group_key(feature, column) {
            groups.entry(key).or_default().push(i);
        }
    }

    let max_count = groups.values().map(Vec::len).max().unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept: Vec<usize> = Vec::new();

    for (key, members) in &groups {
        let target = (members.len() as f64 / max_count as f64 * cap as f64) as usize;
        let n = target.min(members.len());
        kept.extend(sample(&mut rng, members.len(), n).into_iter().map(|j| members[j]));
        info!(group = %key, total = members.len(), kept = n, "Sampled group");
    }
    kept.sort_unstable();

    VectorLayer {
        features: kept.into_iter().map(|i| layer.features[i].clone()).collect(),
        crs: layer.crs.clone(),
    }
}

/// Writes features as an RFC 7946 FeatureCollection. Coordinates must
/// already be WGS84.
pub fn write_geojson(path: &Path, layer: &VectorLayer) -> Result<()> {
    let features = layer.features.iter()
        .map(|feature| geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&feature.geometry))),
            id: None,
            properties: Some(feature.properties.clone()),
            foreign_members: None,
        })
        .collect();
    let collection = geojson::FeatureCollection { bbox: None, features, foreign_members: None };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::output(parent, e))?;
    }
    let text = serde_json::to_string(&collection).map_err(|e| PipelineError::output(path, e))?;
    fs::write(path, text).map_err(|e| PipelineError::output(path, e))
}

/// Alias, optionally sample, then reduce columns. Sampling runs on the full
/// attribute row so the group column need not be kept.
pub fn prepare_points(mut layer: VectorLayer, config: &PrepareConfig) -> Result<VectorLayer> {
    if let Some(column) = &config.group_column {
        let replaced = apply_aliases(&mut layer, column, &config.aliases);
        info!(replaced, column = %column, "Normalised group names");
    }

    let mut layer = match (&config.group_column, config.sample_cap) {
        (Some(column), Some(cap)) => {
            let before = layer.features.len();
            let sampled = proportional_sample(&layer, column, cap, config.seed);
            info!(before, after = sampled.features.len(), "Proportional sampling done");
            sampled
        }
        (None, Some(_)) => {
            return Err(PipelineError::Config("prepare.sample_cap needs prepare.group_column".into()))
        }
        _ => layer,
    };

    if !config.keep_columns.is_empty() {
        keep_columns(&mut layer, &config.keep_columns);
    }
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Properties;
    use geo::{point, Geometry};
    use serde_json::json;

    fn layer(groups: &[(&str, usize)]) -> VectorLayer {
        let mut features = Vec::new();
        for (name, n) in groups {
            for i in 0..*n {
                let mut properties = Properties::new();
                properties.insert("area_name".into(), json!(name));
                properties.insert("pkid".into(), json!(format!("{}-{}", name, i)));
                properties.insert("extra".into(), json!(i));
                features.push(Feature { geometry: Geometry::Point(point!(x: i as f64, y: 0.0)), properties });
            }
        }
        VectorLayer { features, crs: None }
    }

    fn group_sizes(layer: &VectorLayer) -> BTreeMap<String, usize> {
        let mut sizes = BTreeMap::new();
        for f in &layer.features {
            *sizes.entry(group_key(f, "area_name").unwrap()).or_insert(0) += 1;
        }
        sizes
    }

    #[test]
    fn aliases_fix_group_names() {
        let mut l = layer(&[("中正", 2), ("中正區", 1)]);
        let aliases = HashMap::from([("中正".to_string(), "中正區".to_string())]);
        assert_eq!(apply_aliases(&mut l, "area_name", &aliases), 2);
        assert_eq!(group_sizes(&l).get("中正區"), Some(&3));
    }

    #[test]
    fn keeps_only_listed_columns() {
        let mut l = layer(&[("A", 1)]);
        keep_columns(&mut l, &["pkid".to_string(), "area_name".to_string()]);
        let keys: Vec<&String> = l.features[0].properties.keys().collect();
        assert_eq!(keys.len(), 2);
        assert!(!l.features[0].properties.contains_key("extra"));
    }

    #[test]
    fn sampling_is_proportional_and_bounded() {
        let l = layer(&[("A", 200), ("B", 100), ("C", 5)]);
        let sampled = proportional_sample(&l, "area_name", 50, 42);
        let sizes = group_sizes(&sampled);
        assert_eq!(sizes.get("A"), Some(&50));
        assert_eq!(sizes.get("B"), Some(&25));
        assert_eq!(sizes.get("C"), Some(&1));
    }

    #[test]
    fn cap_larger_than_group_keeps_everything() {
        let l = layer(&[("A", 10), ("B", 4)]);
        let sampled = proportional_sample(&l, "area_name", 1000, 7);
        assert_eq!(sampled.features.len(), 14);
    }

    #[test]
    fn sampling_is_deterministic_for_a_seed() {
        let l = layer(&[("A", 300), ("B", 120)]);
        let ids = |v: &VectorLayer| -> Vec<Value> { v.features.iter().map(|f| f.properties["pkid"].clone()).collect() };
        let a = proportional_sample(&l, "area_name", 40, 42);
        let b = proportional_sample(&l, "area_name", 40, 42);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn sampling_without_group_column_is_a_config_error() {
        let config = PrepareConfig {
            output: "out.geojson".into(),
            keep_columns: vec![],
            group_column: None,
            sample_cap: Some(10),
            seed: 42,
            aliases: HashMap::new(),
        };
        assert!(matches!(prepare_points(layer(&[("A", 3)]), &config), Err(PipelineError::Config(_))));
    }

    #[test]
    fn sampling_uses_group_column_even_when_it_is_not_kept() {
        let config = PrepareConfig {
            output: "out.geojson".into(),
            keep_columns: vec!["pkid".to_string()],
            group_column: Some("area_name".to_string()),
            sample_cap: Some(1000),
            seed: 42,
            aliases: HashMap::new(),
        };
        let prepared = prepare_points(layer(&[("A", 10)]), &config).unwrap();
        assert_eq!(prepared.features.len(), 10);
        assert!(prepared.features.iter().all(|f| f.properties.len() == 1 && f.properties.contains_key("pkid")));
    }

    #[test]
    fn written_geojson_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prepared.geojson");
        write_geojson(&path, &layer(&[("A", 3)])).unwrap();
        let loaded = crate::data::load_vector(&path).unwrap();
        assert_eq!(loaded.features.len(), 3);
        assert_eq!(loaded.features[2].properties["pkid"], "A-2");
    }
}
