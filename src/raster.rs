use crate::error::{PipelineError, Result};
use crate::types::Matrix;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::{debug, info};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GDAL_NODATA: u16 = 42113;
const PLANAR_SEPARATE: u16 = 2;

/// Raster placement from the GeoTIFF pixel-scale and tiepoint tags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

/// Band 1 of a DEM, row-major from the top-left pixel.
#[derive(Debug, Clone)]
pub struct DemRaster {
    pub elevation: Matrix,
    pub nodata: Option<f64>,
    pub transform: Option<GeoTransform>,
}

/// Downsampled surface ready for a 3D surface plot.
#[derive(Debug, Clone)]
pub struct DemSurface {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Matrix,
    pub z_min: f64,
    pub z_max: f64,
}

pub fn load_dem(path: &Path) -> Result<DemRaster> {
    let file = File::open(path)
        .map_err(|e| PipelineError::load(path, format!("failed to open DEM: {}", e)))?;
    let raster = decode_dem(BufReader::new(file))
        .map_err(|e| PipelineError::load(path, e))?;
    info!(
        path = %path.display(),
        width = raster.elevation.cols,
        height = raster.elevation.rows,
        nodata = ?raster.nodata,
        "Loaded DEM"
    );
    Ok(raster)
}

fn decode_dem<R: Read + Seek>(reader: R) -> std::result::Result<DemRaster, String> {
    let mut decoder = Decoder::new(reader).map_err(|e| format!("failed to initialise TIFF decoder: {}", e))?;
    let (width, height) = decoder.dimensions().map_err(|e| format!("cannot read dimensions: {}", e))?;

    let samples = match decoder.colortype().map_err(|e| e.to_string())? {
        ColorType::Gray(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) => 3,
        ColorType::RGBA(_) | ColorType::CMYK(_) => 4,
        other => return Err(format!("unsupported sample layout {:?}", other)),
    };

    let planar = decoder.find_tag(Tag::PlanarConfiguration).ok().flatten()
        .and_then(|v| v.into_u16().ok())
        .unwrap_or(1);
    check_interleaving(samples, planar)?;

    let nodata = find_ascii(&mut decoder, GDAL_NODATA)
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok());
    let transform = read_transform(&mut decoder);

    let values: Vec<f64> = match decoder.read_image().map_err(|e| format!("failed to decode pixels: {}", e))? {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
    };

    // Band 1 of pixel-interleaved samples.
    let data: Vec<f64> = values.into_iter().step_by(samples).collect();
    let (rows, cols) = (height as usize, width as usize);
    if data.len() != rows * cols {
        return Err(format!("expected {} pixels, decoded {}", rows * cols, data.len()));
    }

    Ok(DemRaster { elevation: Matrix { rows, cols, data }, nodata, transform })
}

// Band 1 is taken by striding over pixel-interleaved samples, which only
// holds for chunky planar configuration.
fn check_interleaving(samples: usize, planar: u16) -> std::result::Result<(), String> {
    if samples > 1 && planar == PLANAR_SEPARATE {
        return Err(format!("planar-separate TIFF with {} samples per pixel is not supported", samples));
    }
    Ok(())
}

fn find_ascii<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<String> {
    let value = decoder.find_tag(Tag::from_u16_exhaustive(code)).ok()??;
    value.into_string().ok()
}

fn find_doubles<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<f64>> {
    let value = decoder.find_tag(Tag::from_u16_exhaustive(code)).ok()??;
    value.into_f64_vec().ok()
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = find_doubles(decoder, MODEL_PIXEL_SCALE)?;
    let tiepoint = find_doubles(decoder, MODEL_TIEPOINT)?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        debug!("Ignoring malformed GeoTIFF placement tags");
        return None;
    }
    // Tiepoint (i, j, k, x, y, z) pins raster pixel (i, j) to model (x, y).
    Some(GeoTransform {
        origin_x: tiepoint[3] - tiepoint[0] * scale[0],
        origin_y: tiepoint[4] + tiepoint[1] * scale[1],
        pixel_width: scale[0],
        pixel_height: scale[1],
    })
}

impl DemRaster {
    /// Nodata pixels and NaN become `fill`.
    pub fn fill_nodata(&mut self, fill: f64) -> usize {
        let nodata = self.nodata;
        let mut filled = 0;
        for v in self.elevation.data.iter_mut() {
            if v.is_nan() || nodata == Some(*v) {
                *v = fill;
                filled += 1;
            }
        }
        debug!(filled, "Filled nodata pixels");
        filled
    }

    /// Keeps every `factor`-th row and column starting at the top-left pixel.
    /// Axes are model coordinates when the raster is georeferenced, pixel
    /// indices otherwise.
    pub fn downsample(&self, factor: usize, z_cap: Option<f64>) -> Result<DemSurface> {
        if factor == 0 {
            return Err(PipelineError::Config("downsample factor must be at least 1".into()));
        }
        let source = &self.elevation;
        let rows: Vec<usize> = (0..source.rows).step_by(factor).collect();
        let cols: Vec<usize> = (0..source.cols).step_by(factor).collect();

        let mut z = Matrix::zeros(rows.len(), cols.len());
        for (r, &src_row) in rows.iter().enumerate() {
            for (c, &src_col) in cols.iter().enumerate() {
                z.set(r, c, source.get(src_row, src_col));
            }
        }

        let (x, y) = match &self.transform {
            Some(t) => (
                cols.iter().map(|&c| t.origin_x + (c as f64 + 0.5) * t.pixel_width).collect(),
                rows.iter().map(|&r| t.origin_y - (r as f64 + 0.5) * t.pixel_height).collect(),
            ),
            None => (
                cols.iter().map(|&c| c as f64).collect(),
                rows.iter().map(|&r| r as f64).collect(),
            ),
        };

        let (z_min, data_max) = z.min_max()
            .ok_or_else(|| PipelineError::DegenerateInput("DEM has no pixels".into()))?;
        let z_max = z_cap.unwrap_or(data_max);

        Ok(DemSurface { x, y, z, z_min, z_max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(rows: usize, cols: usize, nodata: Option<f64>) -> DemRaster {
        let data = (0..rows * cols).map(|i| i as f64).collect();
        DemRaster { elevation: Matrix { rows, cols, data }, nodata, transform: None }
    }

    #[test]
    fn nodata_and_nan_become_zero() {
        let mut dem = raster(2, 2, Some(-9999.0));
        dem.elevation.data = vec![-9999.0, 5.0, f64::NAN, 7.0];
        assert_eq!(dem.fill_nodata(0.0), 2);
        assert_eq!(dem.elevation.data, vec![0.0, 5.0, 0.0, 7.0]);
    }

    #[test]
    fn stride_downsampling_keeps_top_left_lattice() {
        let dem = raster(9, 10, None);
        let surface = dem.downsample(4, None).unwrap();
        assert_eq!((surface.z.rows, surface.z.cols), (3, 3));
        assert_eq!(surface.x, vec![0.0, 4.0, 8.0]);
        assert_eq!(surface.y, vec![0.0, 4.0, 8.0]);
        assert_eq!(surface.z.get(1, 2), (4 * 10 + 8) as f64);
        assert_eq!(surface.z_min, 0.0);
        assert_eq!(surface.z_max, (8 * 10 + 8) as f64);
    }

    #[test]
    fn factor_one_is_identity() {
        let dem = raster(3, 2, None);
        let surface = dem.downsample(1, Some(100.0)).unwrap();
        assert_eq!(surface.z, dem.elevation);
        assert_eq!(surface.z_max, 100.0);
        assert!(dem.downsample(0, None).is_err());
    }

    #[test]
    fn georeferenced_axes_use_pixel_centers() {
        let mut dem = raster(4, 4, None);
        dem.transform = Some(GeoTransform { origin_x: 119.0, origin_y: 24.0, pixel_width: 0.5, pixel_height: 0.25 });
        let surface = dem.downsample(2, None).unwrap();
        assert_eq!(surface.x, vec![119.25, 120.25]);
        assert_eq!(surface.y, vec![23.875, 23.375]);
    }

    #[test]
    fn corrupt_tiff_is_rejected() {
        let err = decode_dem(std::io::Cursor::new(b"not a tiff".to_vec())).unwrap_err();
        assert!(err.contains("TIFF"));
    }

    #[test]
    fn planar_separate_multiband_is_rejected() {
        assert!(check_interleaving(3, PLANAR_SEPARATE).unwrap_err().contains("planar-separate"));
        assert!(check_interleaving(3, 1).is_ok());
        assert!(check_interleaving(1, PLANAR_SEPARATE).is_ok());
    }

    #[test]
    fn missing_dem_is_a_load_error() {
        assert!(matches!(load_dem(Path::new("nowhere/dem.tif")), Err(PipelineError::DataLoad { .. })));
    }

    #[test]
    fn decodes_single_band_tiff() {
        use tiff::encoder::{colortype, TiffEncoder};
        let mut bytes = std::io::Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
            let pixels: Vec<f32> = vec![1.0, 2.0, 3.0, -9999.0, 5.0, 6.0];
            encoder.write_image::<colortype::Gray32Float>(3, 2, &pixels).unwrap();
        }
        bytes.set_position(0);
        let dem = decode_dem(bytes).unwrap();
        assert_eq!((dem.elevation.rows, dem.elevation.cols), (2, 3));
        assert_eq!(dem.elevation.get(1, 0), -9999.0);
        assert!(dem.transform.is_none());
        assert!(dem.nodata.is_none());
    }
}
