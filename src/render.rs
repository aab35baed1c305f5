use crate::config::{LayerConfig, ProcessingConfig, ViewConfig};
use crate::density::DensitySurface;
use crate::error::{PipelineError, Result};
use crate::raster::DemSurface;
use crate::types::{GridCell, Matrix, Region, Rgba};
use image::{ImageBuffer, Rgba as Pixel, RgbaImage};
use serde::Serialize;
use serde_json::{json, Map};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const REGION_LAYERS_FILE: &str = "region_counts.json";
pub const REGION_CSV_FILE: &str = "region_counts.csv";
pub const DENSITY_LAYERS_FILE: &str = "density_grid.json";
pub const DENSITY_PREVIEW_FILE: &str = "density_grid.png";
pub const DEM_SURFACE_FILE: &str = "dem_surface.json";
pub const DEM_PREVIEW_FILE: &str = "dem_surface.png";

// Pixels per grid cell in the density preview.
const PREVIEW_CELL_PX: u32 = 8;

const DEM_COLORSCALE: [(f64, &str, [u8; 3]); 5] = [
    (0.0, "lightblue", [173, 216, 230]),
    (0.25, "lightgreen", [144, 238, 144]),
    (0.5, "lightyellow", [255, 255, 224]),
    (0.75, "lightsalmon", [255, 160, 122]),
    (1.0, "lightcoral", [240, 128, 128]),
];

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum Layer {
    GeoJsonLayer {
        id: String,
        data: geojson::FeatureCollection,
        stroked: bool,
        filled: bool,
        extruded: bool,
        pickable: bool,
        elevation_scale: f64,
        get_fill_color: Rgba,
        get_line_color: Rgba,
    },
    ColumnLayer {
        id: String,
        data: Vec<ColumnDatum>,
        get_position: String,
        get_elevation: String,
        get_fill_color: String,
        radius: f64,
        pickable: bool,
    },
    PolygonLayer {
        id: String,
        data: Vec<OutlineDatum>,
        get_polygon: String,
        get_fill_color: Rgba,
        get_line_color: Rgba,
        line_width_min_pixels: f64,
        extruded: bool,
        pickable: bool,
    },
    GridLayer {
        id: String,
        data: Vec<GridCell>,
        get_position: String,
        get_elevation_weight: String,
        get_color_weight: String,
        cell_size: f64,
        elevation_scale: f64,
        extruded: bool,
        pickable: bool,
        color_range: Vec<Rgba>,
    },
}

/// One column per region. Field names are what the layer accessors refer to.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnDatum {
    pub name: String,
    pub centroid_lon: f64,
    pub centroid_lat: f64,
    pub elevation: f64,
    pub count: u32,
    pub column_color: Rgba,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineDatum {
    pub name: String,
    pub polygon: Vec<Vec<[f64; 2]>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewState {
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: f64,
    pub pitch: f64,
}

impl From<&ViewConfig> for ViewState {
    fn from(v: &ViewConfig) -> Self {
        Self { latitude: v.latitude, longitude: v.longitude, zoom: v.zoom, pitch: v.pitch }
    }
}

#[derive(Debug, Serialize)]
pub struct DeckSpec {
    pub layers: Vec<Layer>,
    pub initial_view_state: ViewState,
    pub tooltip: Tooltip,
}

#[derive(Debug, Serialize)]
pub struct Tooltip {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SurfacePlot {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<Vec<f64>>,
    pub z_range: [f64; 2],
    pub colorscale: Vec<(f64, &'static str)>,
}

/// Extruded boundaries plus one column per region.
pub fn region_deck(regions: &[Region], layers: &LayerConfig, view: &ViewConfig) -> DeckSpec {
    let features = regions.iter()
        .map(|region| {
            let mut properties = Map::new();
            properties.insert("name".into(), json!(region.name));
            properties.insert("count".into(), json!(region.count));
            properties.insert("elevation".into(), json!(region.elevation));
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&region.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let columns = regions.iter()
        .map(|region| ColumnDatum {
            name: region.name.clone(),
            centroid_lon: region.centroid_lon,
            centroid_lat: region.centroid_lat,
            elevation: region.elevation,
            count: region.count,
            column_color: region.column_color,
        })
        .collect();

    DeckSpec {
        layers: vec![
            Layer::GeoJsonLayer {
                id: "region-boundaries".into(),
                data: geojson::FeatureCollection { bbox: None, features, foreign_members: None },
                stroked: true,
                filled: true,
                extruded: true,
                pickable: true,
                elevation_scale: layers.boundary_elevation_scale,
                get_fill_color: layers.boundary_fill,
                get_line_color: layers.boundary_line,
            },
            Layer::ColumnLayer {
                id: "region-columns".into(),
                data: columns,
                get_position: "[centroid_lon, centroid_lat]".into(),
                get_elevation: "elevation".into(),
                get_fill_color: "column_color".into(),
                radius: layers.column_radius,
                pickable: true,
            },
        ],
        initial_view_state: view.into(),
        tooltip: Tooltip { text: "Region: {name}\nParking spaces: {count}".into() },
    }
}

fn outlines(regions: &[Region]) -> Vec<OutlineDatum> {
    regions.iter()
        .flat_map(|region| {
            region.geometry.0.iter().map(move |polygon| {
                let rings = std::iter::once(polygon.exterior())
                    .chain(polygon.interiors())
                    .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
                    .collect();
                OutlineDatum { name: region.name.clone(), polygon: rings }
            })
        })
        .collect()
}

/// Region outlines under the smoothed density grid.
pub fn density_deck(
    surface: &DensitySurface,
    regions: &[Region],
    processing: &ProcessingConfig,
    layers: &LayerConfig,
    view: &ViewConfig,
) -> DeckSpec {
    DeckSpec {
        layers: vec![
            Layer::PolygonLayer {
                id: "region-outlines".into(),
                data: outlines(regions),
                get_polygon: "polygon".into(),
                get_fill_color: [0, 0, 0, 0],
                get_line_color: [0, 0, 0, 255],
                line_width_min_pixels: 2.0,
                extruded: false,
                pickable: true,
            },
            Layer::GridLayer {
                id: "parking-density".into(),
                data: surface.cells.clone(),
                get_position: "[lon, lat]".into(),
                get_elevation_weight: "elevation".into(),
                get_color_weight: "elevation".into(),
                cell_size: layers.cell_size,
                elevation_scale: layers.grid_elevation_scale,
                extruded: true,
                pickable: true,
                color_range: processing.color_range.to_vec(),
            },
        ],
        initial_view_state: view.into(),
        tooltip: Tooltip { text: "Parking density: {elevationValue}".into() },
    }
}

pub fn surface_plot(surface: &DemSurface) -> SurfacePlot {
    SurfacePlot {
        x: surface.x.clone(),
        y: surface.y.clone(),
        z: (0..surface.z.rows).map(|r| surface.z.row(r).to_vec()).collect(),
        z_range: [surface.z_min, surface.z_max],
        colorscale: DEM_COLORSCALE.iter().map(|(stop, name, _)| (*stop, *name)).collect(),
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| PipelineError::output(dir, e))
}

pub fn write_json<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(file_name);
    let text = serde_json::to_string(value).map_err(|e| PipelineError::output(&path, e))?;
    fs::write(&path, text).map_err(|e| PipelineError::output(&path, e))?;
    info!(path = %path.display(), "Wrote layer description");
    Ok(path)
}

#[derive(Serialize)]
struct RegionRow<'a> {
    name: &'a str,
    count: u32,
    elevation: f64,
    centroid_lon: f64,
    centroid_lat: f64,
}

pub fn write_region_csv(dir: &Path, regions: &[Region]) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(REGION_CSV_FILE);
    let mut writer = csv::Writer::from_path(&path).map_err(|e| PipelineError::output(&path, e))?;
    for region in regions {
        writer.serialize(RegionRow {
            name: &region.name,
            count: region.count,
            elevation: region.elevation,
            centroid_lon: region.centroid_lon,
            centroid_lat: region.centroid_lat,
        }).map_err(|e| PipelineError::output(&path, e))?;
    }
    writer.flush().map_err(|e| PipelineError::output(&path, e))?;
    Ok(path)
}

/// Bucket of `value` in an evenly split ramp of `stops` colors over (0, max].
fn ramp_index(value: f64, max: f64, stops: usize) -> usize {
    if max <= 0.0 || stops == 0 {
        return 0;
    }
    let t = (value / max).clamp(0.0, 1.0);
    ((t * stops as f64) as usize).min(stops - 1)
}

/// Grid cells above `threshold` colored by the configured ramp, north up.
pub fn density_image(smoothed: &Matrix, color_range: &[Rgba], threshold: f64) -> RgbaImage {
    let width = smoothed.cols as u32 * PREVIEW_CELL_PX;
    let height = smoothed.rows as u32 * PREVIEW_CELL_PX;
    let max = smoothed.min_max().map(|(_, hi)| hi).unwrap_or(0.0);

    ImageBuffer::from_fn(width, height, |px, py| {
        let col = (px / PREVIEW_CELL_PX) as usize;
        let row = smoothed.rows - 1 - (py / PREVIEW_CELL_PX) as usize;
        let value = smoothed.get(row, col);
        if value <= threshold || color_range.is_empty() {
            return Pixel([0, 0, 0, 0]);
        }
        Pixel(color_range[ramp_index(value, max, color_range.len())])
    })
}

fn lerp_color(a: [u8; 3], b: [u8; 3], t: f64) -> [u8; 3] {
    let mix = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * t).round().clamp(0.0, 255.0) as u8;
    [mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2])]
}

fn dem_color(value: f64, z_min: f64, z_max: f64) -> [u8; 3] {
    let t = if z_max > z_min { ((value - z_min) / (z_max - z_min)).clamp(0.0, 1.0) } else { 0.0 };
    for pair in DEM_COLORSCALE.windows(2) {
        let (lo, _, c0) = pair[0];
        let (hi, _, c1) = pair[1];
        if t <= hi {
            return lerp_color(c0, c1, (t - lo) / (hi - lo));
        }
    }
    DEM_COLORSCALE[DEM_COLORSCALE.len() - 1].2
}

/// One pixel per sample, first row at the top.
pub fn dem_image(surface: &DemSurface) -> RgbaImage {
    ImageBuffer::from_fn(surface.z.cols as u32, surface.z.rows as u32, |x, y| {
        let [r, g, b] = dem_color(surface.z.get(y as usize, x as usize), surface.z_min, surface.z_max);
        Pixel([r, g, b, 255])
    })
}

pub fn save_png(dir: &Path, file_name: &str, img: &RgbaImage) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(file_name);
    img.save(&path).map_err(|e| PipelineError::output(&path, e))?;
    info!(path = %path.display(), "Wrote preview");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::{linspace, BinEdges};
    use geo::{polygon, MultiPolygon};

    fn region(name: &str, count: u32) -> Region {
        Region {
            name: name.into(),
            geometry: MultiPolygon::new(vec![polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)]]),
            count,
            elevation: count as f64 * 10.0,
            centroid_lon: 0.66,
            centroid_lat: 0.33,
            column_color: [255, 50, 0, 200],
        }
    }

    #[test]
    fn region_deck_serializes_both_layers() {
        let deck = region_deck(&[region("中正區", 3)], &LayerConfig::default(), &ViewConfig::default());
        let value = serde_json::to_value(&deck).unwrap();

        assert_eq!(value["layers"][0]["type"], "GeoJsonLayer");
        assert_eq!(value["layers"][0]["get_fill_color"], json!([255, 255, 255, 100]));
        assert_eq!(value["layers"][0]["data"]["features"][0]["properties"]["count"], 3);
        assert_eq!(value["layers"][1]["type"], "ColumnLayer");
        assert_eq!(value["layers"][1]["radius"], 300.0);
        assert_eq!(value["layers"][1]["get_position"], "[centroid_lon, centroid_lat]");
        assert_eq!(value["layers"][1]["get_elevation"], "elevation");
        assert_eq!(value["layers"][1]["get_fill_color"], "column_color");
        assert_eq!(value["layers"][1]["data"][0]["centroid_lon"], 0.66);
        assert_eq!(value["layers"][1]["data"][0]["centroid_lat"], 0.33);
        assert_eq!(value["layers"][1]["data"][0]["column_color"], json!([255, 50, 0, 200]));
        assert_eq!(value["initial_view_state"]["pitch"], 45.0);
    }

    #[test]
    fn density_deck_carries_color_range() {
        let surface = DensitySurface {
            smoothed: Matrix::zeros(1, 1),
            edges: BinEdges { lon: linspace(0.0, 1.0, 2), lat: linspace(0.0, 1.0, 2) },
            cells: vec![GridCell { lon: 0.5, lat: 0.5, elevation: 2.0 }],
        };
        let processing = ProcessingConfig::default();
        let deck = density_deck(&surface, &[region("A", 1)], &processing, &LayerConfig::default(), &ViewConfig::default());
        let value = serde_json::to_value(&deck).unwrap();

        assert_eq!(value["layers"][0]["type"], "PolygonLayer");
        assert_eq!(value["layers"][0]["get_polygon"], "polygon");
        assert_eq!(value["layers"][0]["data"][0]["polygon"][0][1], json!([1.0, 0.0]));
        assert_eq!(value["layers"][1]["type"], "GridLayer");
        assert_eq!(value["layers"][1]["color_range"].as_array().unwrap().len(), 7);
        assert_eq!(value["layers"][1]["get_position"], "[lon, lat]");
        assert_eq!(value["layers"][1]["get_elevation_weight"], "elevation");
        assert_eq!(value["layers"][1]["get_color_weight"], "elevation");
        assert_eq!(value["layers"][1]["data"][0]["lon"], 0.5);
        assert_eq!(value["layers"][1]["data"][0]["elevation"], 2.0);
    }

    #[test]
    fn ramp_buckets() {
        assert_eq!(ramp_index(0.1, 7.0, 7), 0);
        assert_eq!(ramp_index(3.5, 7.0, 7), 3);
        assert_eq!(ramp_index(7.0, 7.0, 7), 6);
        assert_eq!(ramp_index(1.0, 0.0, 7), 0);
    }

    #[test]
    fn density_image_hides_thin_cells() {
        let m = Matrix { rows: 2, cols: 1, data: vec![0.5, 4.0] };
        let img = density_image(&m, &crate::config::DEFAULT_COLOR_RANGE, 1.0);
        assert_eq!(img.dimensions(), (PREVIEW_CELL_PX, 2 * PREVIEW_CELL_PX));
        // Row 1 (north) is drawn at the top.
        assert_eq!(img.get_pixel(0, 0).0, [189, 0, 38, 150]);
        assert_eq!(img.get_pixel(0, PREVIEW_CELL_PX).0[3], 0);
    }

    #[test]
    fn dem_colors_hit_the_stops() {
        assert_eq!(dem_color(0.0, 0.0, 100.0), [173, 216, 230]);
        assert_eq!(dem_color(50.0, 0.0, 100.0), [255, 255, 224]);
        assert_eq!(dem_color(500.0, 0.0, 100.0), [240, 128, 128]);
        assert_eq!(dem_color(5.0, 5.0, 5.0), [173, 216, 230]);
    }

    #[test]
    fn writes_json_csv_and_png() {
        let dir = tempfile::tempdir().unwrap();
        let regions = vec![region("A", 2), region("B", 0)];
        let deck = region_deck(&regions, &LayerConfig::default(), &ViewConfig::default());

        let json_path = write_json(dir.path(), REGION_LAYERS_FILE, &deck).unwrap();
        let csv_path = write_region_csv(dir.path(), &regions).unwrap();
        let png_path = save_png(dir.path(), DENSITY_PREVIEW_FILE, &density_image(&Matrix::zeros(2, 2), &[], 1.0)).unwrap();

        assert!(json_path.exists() && png_path.exists());
        let csv_text = fs::read_to_string(csv_path).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(lines.next(), Some("name,count,elevation,centroid_lon,centroid_lat"));
        assert!(lines.next().unwrap().starts_with("A,2,20"));
    }
}
