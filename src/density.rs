use crate::config::ProcessingConfig;
use crate::error::{PipelineError, Result};
use crate::types::{GridCell, Matrix, PointFeature, VectorLayer};
use geo::algorithm::centroid::Centroid;
use geo::{Point, Rect};
use tracing::{debug, info};

/// Replaces every geometry with its planar centroid. Empty geometries have no
/// centroid and are dropped.
pub fn reduce_to_centroids(layer: &VectorLayer) -> Vec<PointFeature> {
    let mut dropped = 0usize;
    let points: Vec<PointFeature> = layer.features.iter()
        .filter_map(|feature| {
            let point = feature.geometry.centroid();
            if point.is_none() {
                dropped += 1;
            }
            Some(PointFeature { point: point?, properties: feature.properties.clone() })
        })
        .collect();
    if dropped > 0 {
        debug!(dropped, "Dropped features without a centroid");
    }
    points
}

/// `n` evenly spaced values from `start` to `end`, both included.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut values: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            values[n - 1] = end;
            values
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinEdges {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
}

impl BinEdges {
    pub fn lon_centers(&self) -> Vec<f64> {
        centers(&self.lon)
    }

    pub fn lat_centers(&self) -> Vec<f64> {
        centers(&self.lat)
    }
}

fn centers(edges: &[f64]) -> Vec<f64> {
    edges.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
}

/// Point counts per cell. Rows are latitude bins (south to north), columns
/// longitude bins (west to east).
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGrid {
    pub counts: Matrix,
    pub edges: BinEdges,
}

// Half-open bins, the last one closed on the right. None outside the edges.
fn bin_index(edges: &[f64], value: f64) -> Option<usize> {
    let first = *edges.first()?;
    let last = *edges.last()?;
    if value.is_nan() || value < first || value > last {
        return None;
    }
    let bins = edges.len() - 1;
    if value == last {
        return Some(bins - 1);
    }
    let upper = edges.partition_point(|&e| e <= value);
    Some((upper - 1).min(bins - 1))
}

/// 2D histogram of `points` over `bounds` with `grid_size` edges per axis,
/// i.e. `(grid_size - 1)²` cells.
pub fn bin_points(points: &[Point<f64>], bounds: Rect<f64>, grid_size: usize) -> Result<DensityGrid> {
    if grid_size < 2 {
        return Err(PipelineError::Config(format!("grid_size must be at least 2, got {}", grid_size)));
    }
    let (min, max) = (bounds.min(), bounds.max());
    if !(max.x > min.x && max.y > min.y) {
        return Err(PipelineError::DegenerateInput(format!(
            "bounding box ({}, {}) - ({}, {}) has no area",
            min.x, min.y, max.x, max.y
        )));
    }

    let edges = BinEdges {
        lon: linspace(min.x, max.x, grid_size),
        lat: linspace(min.y, max.y, grid_size),
    };
    let bins = grid_size - 1;
    let mut counts = Matrix::zeros(bins, bins);
    let mut outside = 0usize;

    for point in points {
        match (bin_index(&edges.lon, point.x()), bin_index(&edges.lat, point.y())) {
            (Some(col), Some(row)) => counts.set(row, col, counts.get(row, col) + 1.0),
            _ => outside += 1,
        }
    }

    debug!(binned = points.len() - outside, outside, bins, "Binned points");
    Ok(DensityGrid { counts, edges })
}

/// Normalized 1D Gaussian kernel truncated at four standard deviations.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let mut weights: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect();
    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

// Symmetric extension about the edge (d c b a | a b c d | d c b a).
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let m = index.rem_euclid(period);
    (if m >= len { period - 1 - m } else { m }) as usize
}

fn convolve_line(line: &[f64], kernel: &[f64], out: &mut [f64]) {
    let radius = (kernel.len() / 2) as isize;
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = kernel.iter().enumerate()
            .map(|(k, w)| w * line[reflect(i as isize + k as isize - radius, line.len())])
            .sum();
    }
}

/// Separable Gaussian blur with standard deviation `sigma` (in cells).
/// The output has the same shape as the input; `sigma == 0` copies it.
pub fn gaussian_smooth(input: &Matrix, sigma: f64) -> Matrix {
    if sigma <= 0.0 || input.rows == 0 || input.cols == 0 {
        return input.clone();
    }
    let kernel = gaussian_kernel(sigma);

    // Along rows.
    let mut horizontal = Matrix::zeros(input.rows, input.cols);
    for r in 0..input.rows {
        let start = r * input.cols;
        convolve_line(input.row(r), &kernel, &mut horizontal.data[start..start + input.cols]);
    }

    // Along columns.
    let mut output = Matrix::zeros(input.rows, input.cols);
    let mut column = vec![0.0; input.rows];
    let mut smoothed = vec![0.0; input.rows];
    for c in 0..input.cols {
        for (r, v) in column.iter_mut().enumerate() {
            *v = horizontal.get(r, c);
        }
        convolve_line(&column, &kernel, &mut smoothed);
        for (r, v) in smoothed.iter().enumerate() {
            output.set(r, c, *v);
        }
    }
    output
}

/// Cell-center records whose weight exceeds `threshold`.
pub fn populated_cells(smoothed: &Matrix, edges: &BinEdges, threshold: f64) -> Vec<GridCell> {
    let lon_centers = edges.lon_centers();
    let lat_centers = edges.lat_centers();
    let mut cells = Vec::new();
    for (col, &lon) in lon_centers.iter().enumerate() {
        for (row, &lat) in lat_centers.iter().enumerate() {
            let elevation = smoothed.get(row, col);
            if elevation > threshold {
                cells.push(GridCell { lon, lat, elevation });
            }
        }
    }
    cells
}

/// Output of the density-grid pipeline.
#[derive(Debug, Clone)]
pub struct DensitySurface {
    pub smoothed: Matrix,
    pub edges: BinEdges,
    pub cells: Vec<GridCell>,
}

/// Bins the parking points over the boundary extent, smooths, and keeps the
/// populated cells.
pub fn run_density_pipeline(
    config: &ProcessingConfig,
    boundaries: &VectorLayer,
    points: &[PointFeature],
) -> Result<DensitySurface> {
    let bounds = boundaries.total_bounds()
        .ok_or_else(|| PipelineError::DegenerateInput("boundary layer is empty".into()))?;
    let locations: Vec<Point<f64>> = points.iter().map(|p| p.point).collect();

    let grid = bin_points(&locations, bounds, config.grid_size)?;
    let smoothed = gaussian_smooth(&grid.counts, config.smoothing_sigma);
    let cells = populated_cells(&smoothed, &grid.edges, config.min_elevation);

    info!(
        grid_size = config.grid_size,
        sigma = config.smoothing_sigma,
        cells = cells.len(),
        "Density grid ready"
    );
    Ok(DensitySurface { smoothed, edges: grid.edges, cells })
}
