pub mod types;
pub mod config;
pub mod error;
pub mod crs;
pub mod data;
pub mod join;
pub mod processing;
pub mod density;
pub mod raster;
pub mod render;
pub mod prepare;
pub mod server;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::types::{PointFeature, VectorLayer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the region, density and DEM pipelines and write the map layers
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the generated layers and the region lookup API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Normalise, trim and sample the parking inventory
    Prepare {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

struct Inputs {
    boundaries: VectorLayer,
    points: Vec<PointFeature>,
}

fn load_inputs(app_config: &AppConfig) -> anyhow::Result<Inputs> {
    let boundaries = data::load_vector(&app_config.input.boundaries)
        .and_then(crs::normalize)
        .context("Failed to prepare boundary layer")?;
    let points_layer = data::load_vector(&app_config.input.points)
        .and_then(crs::normalize)
        .context("Failed to prepare parking layer")?;
    let points = density::reduce_to_centroids(&points_layer);
    Ok(Inputs { boundaries, points })
}

fn generate(app_config: &AppConfig) -> anyhow::Result<()> {
    let out_dir = &app_config.output.dir;

    // 1. Load and normalise
    let inputs = load_inputs(app_config)?;
    println!("Loaded {} boundary features and {} parking spaces",
        inputs.boundaries.features.len(), inputs.points.len());

    // 2. Region counts
    let regions = processing::regions_from_layer(&inputs.boundaries, &app_config.input.name_column)?;
    let summary = processing::run_region_pipeline(&app_config.processing, regions, &inputs.points)?;
    println!("{} of {} parking spaces matched {} regions (max {})",
        summary.matched, summary.matched + summary.unmatched, summary.regions.len(), summary.max_count);

    let deck = render::region_deck(&summary.regions, &app_config.layers, &app_config.view);
    render::write_json(out_dir, render::REGION_LAYERS_FILE, &deck)?;
    render::write_region_csv(out_dir, &summary.regions)?;

    // 3. Density surface
    let surface = density::run_density_pipeline(&app_config.processing, &inputs.boundaries, &inputs.points)?;
    println!("Density grid: {} populated cells", surface.cells.len());

    let deck = render::density_deck(&surface, &summary.regions, &app_config.processing, &app_config.layers, &app_config.view);
    render::write_json(out_dir, render::DENSITY_LAYERS_FILE, &deck)?;
    let preview = render::density_image(&surface.smoothed, &app_config.processing.color_range, app_config.processing.min_elevation);
    render::save_png(out_dir, render::DENSITY_PREVIEW_FILE, &preview)?;

    // 4. DEM surface (if configured)
    if let Some(dem_path) = &app_config.input.dem {
        let mut dem = raster::load_dem(dem_path)?;
        dem.fill_nodata(0.0);
        let surface = dem.downsample(app_config.dem.downsample, app_config.dem.z_max)?;
        println!("DEM downsampled to {}x{} (z {:.1} .. {:.1})",
            surface.z.cols, surface.z.rows, surface.z_min, surface.z_max);
        render::write_json(out_dir, render::DEM_SURFACE_FILE, &render::surface_plot(&surface))?;
        render::save_png(out_dir, render::DEM_PREVIEW_FILE, &render::dem_image(&surface))?;
    }

    Ok(())
}

fn prepare(app_config: &AppConfig) -> anyhow::Result<()> {
    let Some(prepare_config) = &app_config.prepare else {
        bail!("No [prepare] section in configuration");
    };
    let layer = data::load_vector(&app_config.input.points)
        .and_then(crs::normalize)
        .context("Failed to load parking layer")?;
    let before = layer.features.len();
    let prepared = prepare::prepare_points(layer, prepare_config)?;
    prepare::write_geojson(&prepare_config.output, &prepared)?;
    println!("Wrote {} of {} features to {:?}", prepared.features.len(), before, prepare_config.output);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config } => {
            println!("Generating map layers with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            generate(&app_config)?;
            println!("Generation complete!");
        }
        Commands::Serve { config } => {
            println!("Serving map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;

            // Region counts back the lookup API.
            let inputs = load_inputs(&app_config)?;
            let regions = processing::regions_from_layer(&inputs.boundaries, &app_config.input.name_column)?;
            let summary = processing::run_region_pipeline(&app_config.processing, regions, &inputs.points)?;

            server::start_server(app_config, summary.regions).await?;
        }
        Commands::Prepare { config } => {
            println!("Preparing parking inventory with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            prepare(&app_config)?;
        }
    }

    Ok(())
}
