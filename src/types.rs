use geo::{BoundingRect, Geometry, MultiPolygon, Point, Rect};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::crs::Crs;

/// Red, green, blue, alpha.
pub type Rgba = [u8; 4];

pub type Properties = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub properties: Properties,
}

/// A loaded vector dataset and the CRS it declared, if any.
#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub features: Vec<Feature>,
    pub crs: Option<Crs>,
}

impl VectorLayer {
    /// Bounding box over every feature, `None` for an empty layer.
    pub fn total_bounds(&self) -> Option<Rect<f64>> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                    geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
    pub count: u32,
    pub elevation: f64,
    pub centroid_lon: f64,
    pub centroid_lat: f64,
    pub column_color: Rgba,
}

/// One parking-space record, reduced to a point.
#[derive(Debug, Clone)]
pub struct PointFeature {
    pub point: Point<f64>,
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridCell {
    pub lon: f64,
    pub lat: f64,
    pub elevation: f64,
}

/// Dense row-major matrix of f64.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// (min, max) ignoring NaN, `None` when nothing finite is present.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    #[test]
    fn total_bounds_spans_all_features() {
        let layer = VectorLayer {
            features: vec![
                Feature { geometry: Geometry::Point(point!(x: 1.0, y: 5.0)), properties: Properties::new() },
                Feature {
                    geometry: Geometry::Polygon(polygon![(x: -2.0, y: 0.0), (x: 0.0, y: 0.0), (x: 0.0, y: 2.0)]),
                    properties: Properties::new(),
                },
            ],
            crs: None,
        };
        let bounds = layer.total_bounds().unwrap();
        assert_eq!(bounds.min(), geo::coord! { x: -2.0, y: 0.0 });
        assert_eq!(bounds.max(), geo::coord! { x: 1.0, y: 5.0 });
    }

    #[test]
    fn empty_layer_has_no_bounds() {
        let layer = VectorLayer { features: vec![], crs: None };
        assert!(layer.total_bounds().is_none());
    }

    #[test]
    fn matrix_min_max_skips_nan() {
        let m = Matrix { rows: 1, cols: 3, data: vec![f64::NAN, 2.0, -1.0] };
        assert_eq!(m.min_max(), Some((-1.0, 2.0)));
        assert_eq!(Matrix::zeros(0, 0).min_max(), None);
    }
}
