use std::collections::HashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result, bail};

use crate::types::Rgba;

pub const DEFAULT_MAX_HEIGHT: f64 = 5000.0;
pub const DEFAULT_GRID_SIZE: usize = 50;
pub const DEFAULT_SMOOTHING_SIGMA: f64 = 10.0;
pub const DEFAULT_MIN_ELEVATION: f64 = 1.0;

pub const DEFAULT_COLOR_RANGE: [Rgba; 7] = [
    [255, 255, 204, 150],
    [255, 237, 160, 150],
    [254, 217, 118, 150],
    [254, 178, 76, 150],
    [253, 141, 60, 150],
    [240, 59, 32, 150],
    [189, 0, 38, 150],
];

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub layers: LayerConfig,
    #[serde(default)]
    pub dem: DemConfig,
    #[serde(default)]
    pub view: ViewConfig,
    pub prepare: Option<PrepareConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Administrative boundary polygons (.shp or .geojson)
    pub boundaries: PathBuf,
    /// Parking-space inventory (.shp or .geojson)
    pub points: PathBuf,
    /// Attribute holding the unique region name
    pub name_column: String,
    pub dem: Option<PathBuf>,
}

/// Tunables shared by the region and density pipelines.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_height: f64,
    pub grid_size: usize,
    pub smoothing_sigma: f64,
    /// Smoothed cells at or below this weight are not emitted.
    pub min_elevation: f64,
    pub color_range: [Rgba; 7],
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_height: DEFAULT_MAX_HEIGHT,
            grid_size: DEFAULT_GRID_SIZE,
            smoothing_sigma: DEFAULT_SMOOTHING_SIGMA,
            min_elevation: DEFAULT_MIN_ELEVATION,
            color_range: DEFAULT_COLOR_RANGE,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LayerConfig {
    pub boundary_fill: Rgba,
    pub boundary_line: Rgba,
    pub boundary_elevation_scale: f64,
    pub column_radius: f64,
    /// Grid cell edge in meters, as the renderer expects it.
    pub cell_size: f64,
    pub grid_elevation_scale: f64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            boundary_fill: [255, 255, 255, 100],
            boundary_line: [0, 0, 0, 255],
            boundary_elevation_scale: 0.3,
            column_radius: 300.0,
            cell_size: 1000.0,
            grid_elevation_scale: 5.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DemConfig {
    pub downsample: usize,
    pub z_max: Option<f64>,
}

impl Default for DemConfig {
    fn default() -> Self {
        Self { downsample: 4, z_max: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ViewConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: f64,
    pub pitch: f64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        // Taipei 101
        Self { latitude: 25.0330, longitude: 121.5654, zoom: 11.5, pitch: 45.0 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrepareConfig {
    pub output: PathBuf,
    pub keep_columns: Vec<String>,
    pub group_column: Option<String>,
    pub sample_cap: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.processing;
        if p.grid_size < 2 {
            bail!("processing.grid_size must be at least 2, got {}", p.grid_size);
        }
        if !(p.smoothing_sigma >= 0.0) {
            bail!("processing.smoothing_sigma must be >= 0, got {}", p.smoothing_sigma);
        }
        if !(p.max_height > 0.0) {
            bail!("processing.max_height must be > 0, got {}", p.max_height);
        }
        if self.dem.downsample == 0 {
            bail!("dem.downsample must be at least 1");
        }
        if self.input.name_column.is_empty() {
            bail!("input.name_column must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [input]
        boundaries = "b.shp"
        points = "p.shp"
        name_column = "TNAME"

        [output]
        dir = "out"
    "#;

    #[test]
    fn minimal_config_gets_dashboard_defaults() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.processing, ProcessingConfig::default());
        assert_eq!(config.processing.grid_size, 50);
        assert_eq!(config.processing.smoothing_sigma, 10.0);
        assert_eq!(config.processing.max_height, 5000.0);
        assert_eq!(config.processing.color_range[6], [189, 0, 38, 150]);
        assert_eq!(config.layers.column_radius, 300.0);
        assert_eq!(config.dem.downsample, 4);
        assert!(config.prepare.is_none());
        assert!(config.input.dem.is_none());
    }

    #[test]
    fn partial_processing_section_keeps_other_defaults() {
        let text = format!("{MINIMAL}\n[processing]\ngrid_size = 20\n");
        let config = AppConfig::from_toml(&text).unwrap();
        assert_eq!(config.processing.grid_size, 20);
        assert_eq!(config.processing.max_height, DEFAULT_MAX_HEIGHT);
    }

    #[test]
    fn rejects_grid_smaller_than_two_edges() {
        let text = format!("{MINIMAL}\n[processing]\ngrid_size = 1\n");
        let err = AppConfig::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("grid_size"));
    }

    #[test]
    fn rejects_non_positive_max_height() {
        let text = format!("{MINIMAL}\n[processing]\nmax_height = 0.0\n");
        assert!(AppConfig::from_toml(&text).is_err());
    }

    #[test]
    fn prepare_section_defaults_seed() {
        let text = format!(
            "{MINIMAL}\n[prepare]\noutput = \"p.geojson\"\nkeep_columns = [\"pkid\"]\n"
        );
        let config = AppConfig::from_toml(&text).unwrap();
        let prepare = config.prepare.unwrap();
        assert_eq!(prepare.seed, 42);
        assert!(prepare.aliases.is_empty());
        assert!(prepare.sample_cap.is_none());
    }

    #[test]
    fn shipped_config_parses() {
        let text = include_str!("../config.toml");
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.input.name_column, "TNAME");
        assert_eq!(config.prepare.unwrap().aliases.get("中正").map(String::as_str), Some("中正區"));
    }
}
