use crate::crs::{Crs, EPSG_WGS84};
use crate::error::{PipelineError, Result};
use crate::types::{Feature, Properties, VectorLayer};
use geojson::GeoJson;
use serde_json::Value;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Loads a Shapefile or GeoJSON dataset along with the CRS it declares.
pub fn load_vector(path: &Path) -> Result<VectorLayer> {
    if !path.exists() {
        return Err(PipelineError::load(path, "file does not exist"));
    }

    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| PipelineError::load(path, "input geometry file has no extension"))?;

    let layer = match extension.as_str() {
        "shp" => load_shapefile(path)?,
        "json" | "geojson" => load_geojson(path)?,
        _ => return Err(PipelineError::load(path, format!("unsupported geometry format: {}", extension))),
    };

    info!(
        path = %path.display(),
        features = layer.features.len(),
        crs = %layer.crs.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "undefined".into()),
        "Loaded vector layer"
    );
    Ok(layer)
}

fn load_shapefile(path: &Path) -> Result<VectorLayer> {
    let mut reader = Reader::from_path(path)
        .map_err(|e| PipelineError::load(path, format!("failed to open Shapefile: {}", e)))?;

    let mut features = Vec::new();
    let mut skipped = 0usize;

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(|e| PipelineError::load(path, e))?;

        if matches!(shape, shapefile::Shape::NullShape) {
            skipped += 1;
            continue;
        }
        let geometry = geo::Geometry::<f64>::try_from(shape)
            .map_err(|e| PipelineError::load(path, format!("failed to convert shape: {:?}", e)))?;

        let properties: Properties = record
            .into_iter()
            .map(|(name, value)| (name, field_to_json(value)))
            .collect();

        features.push(Feature { geometry, properties });
    }

    if skipped > 0 {
        debug!(skipped, "Skipped null shapes");
    }

    Ok(VectorLayer { features, crs: read_prj(path)? })
}

/// The CRS of a shapefile lives in its `.prj` sidecar; no sidecar means undefined.
fn read_prj(shp_path: &Path) -> Result<Option<Crs>> {
    let prj_path = shp_path.with_extension("prj");
    if !prj_path.exists() {
        return Ok(None);
    }
    let wkt = fs::read_to_string(&prj_path)
        .map_err(|e| PipelineError::load(&prj_path, e))?;
    if wkt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Crs::from_wkt(&wkt)))
}

fn field_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(s)) => Value::String(s.trim().to_string()),
        FieldValue::Memo(s) => Value::String(s),
        FieldValue::Numeric(Some(n)) | FieldValue::Double(n) | FieldValue::Currency(n) => Value::from(n),
        FieldValue::Float(Some(f)) => Value::from(f as f64),
        FieldValue::Integer(i) => Value::from(i),
        FieldValue::Logical(Some(b)) => Value::Bool(b),
        _ => Value::Null,
    }
}

fn load_geojson(path: &Path) -> Result<VectorLayer> {
    let file = File::open(path)
        .map_err(|e| PipelineError::load(path, format!("failed to open GeoJSON file: {}", e)))?;
    let reader = BufReader::new(file);

    // Loads the whole document into memory.
    let geojson = GeoJson::from_reader(reader)
        .map_err(|e| PipelineError::load(path, format!("failed to parse GeoJSON: {}", e)))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(PipelineError::load(path, "GeoJSON must be a FeatureCollection")),
    };

    let crs = match collection.foreign_members.as_ref().and_then(|m| m.get("crs")) {
        Some(member) => {
            let name = member.pointer("/properties/name").and_then(Value::as_str)
                .ok_or_else(|| PipelineError::load(path, "GeoJSON crs member has no properties.name"))?;
            let crs = Crs::from_name(name)
                .ok_or_else(|| PipelineError::Crs { crs: name.to_string(), reason: "unrecognised CRS name".into() })?;
            Some(crs)
        }
        // RFC 7946 coordinates are always WGS84.
        None => Some(Crs::Epsg(EPSG_WGS84)),
    };

    let mut features = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let Some(geometry) = feature.geometry else { continue };
        let geometry = geo::Geometry::<f64>::try_from(geometry.value)
            .map_err(|e| PipelineError::load(path, format!("failed to convert geojson geometry: {:?}", e)))?;
        features.push(Feature { geometry, properties: feature.properties.unwrap_or_default() });
    }

    Ok(VectorLayer { features, crs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Geometry;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load_vector(Path::new("does/not/exist.shp")).unwrap_err();
        assert!(matches!(err, PipelineError::DataLoad { .. }));
    }

    #[test]
    fn unsupported_extension_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "areas.kml", "<kml/>");
        let err = load_vector(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported geometry format"));
    }

    #[test]
    fn corrupt_geojson_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "broken.geojson", "{ not json");
        assert!(matches!(load_vector(&path), Err(PipelineError::DataLoad { .. })));
    }

    #[test]
    fn geojson_features_and_default_crs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "spots.geojson", r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"pkid": "A1"}, "geometry": {"type": "Point", "coordinates": [121.5, 25.0]}},
                {"type": "Feature", "properties": {"pkid": "A2"}, "geometry": null}
            ]
        }"#);
        let layer = load_vector(&path).unwrap();
        assert_eq!(layer.crs, Some(Crs::Epsg(4326)));
        assert_eq!(layer.features.len(), 1);
        assert_eq!(layer.features[0].properties["pkid"], "A1");
        assert!(matches!(layer.features[0].geometry, Geometry::Point(_)));
    }

    #[test]
    fn geojson_legacy_crs_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "twd97.json", r#"{
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3826"}},
            "features": [
                {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [306700.0, 2770400.0]}}
            ]
        }"#);
        let layer = load_vector(&path).unwrap();
        assert_eq!(layer.crs, Some(Crs::Epsg(3826)));
    }

    #[test]
    fn geojson_must_be_a_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "single.geojson", r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#);
        assert!(load_vector(&path).is_err());
    }

    #[test]
    fn dbase_values_map_to_json() {
        assert_eq!(field_to_json(FieldValue::Character(Some(" 中正區 ".into()))), Value::from("中正區"));
        assert_eq!(field_to_json(FieldValue::Numeric(Some(3.0))), Value::from(3.0));
        assert_eq!(field_to_json(FieldValue::Integer(7)), Value::from(7));
        assert_eq!(field_to_json(FieldValue::Logical(Some(true))), Value::Bool(true));
        assert_eq!(field_to_json(FieldValue::Character(None)), Value::Null);
    }

    #[test]
    fn prj_sidecar_sets_crs() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("districts.shp");
        assert_eq!(read_prj(&shp).unwrap(), None);
        write_file(dir.path(), "districts.prj", r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],AUTHORITY["EPSG","4326"]]"#);
        assert_eq!(read_prj(&shp).unwrap(), Some(Crs::Epsg(4326)));
    }
}
