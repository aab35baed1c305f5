use crate::error::{PipelineError, Result};
use crate::types::VectorLayer;
use geo::{Coord, MapCoords};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, info, warn};

pub const EPSG_WGS84: u32 = 4326;

#[derive(Debug, Clone, PartialEq)]
pub enum Crs {
    Epsg(u32),
    Wkt(String),
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{}", code),
            Crs::Wkt(wkt) => {
                let head: String = wkt.chars().take(60).collect();
                write!(f, "WKT {}", head)
            }
        }
    }
}

static AUTHORITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:AUTHORITY|ID)\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).unwrap()
});

static URN_EPSG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)EPSG:(?:[\d.]*:)?:?(\d+)$").unwrap());

static PARAMETER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)PARAMETER\[\s*"([^"]+)"\s*,\s*(-?[\d.]+(?:[eE][-+]?\d+)?)"#).unwrap()
});

static LINEAR_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)UNIT\[\s*"([^"]*)"\s*,\s*([\d.]+(?:[eE][-+]?\d+)?)"#).unwrap()
});

static SPHEROID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:SPHEROID|ELLIPSOID)\[\s*"[^"]*"\s*,\s*([\d.]+)\s*,\s*([\d.]+)"#).unwrap()
});

impl Crs {
    /// Reads the contents of a `.prj` sidecar. The root authority code wins
    /// when the WKT carries one; ESRI-flavoured WKT usually does not.
    pub fn from_wkt(text: &str) -> Crs {
        let text = text.trim();
        // Only the root authority counts: it closes the outermost bracket.
        let root_code = AUTHORITY.captures_iter(text).last().and_then(|caps| {
            let whole = caps.get(0)?;
            (text[whole.end()..].trim() == "]").then(|| caps[1].parse::<u32>().ok())?
        });
        match root_code {
            Some(code) => Crs::Epsg(code),
            None => Crs::Wkt(text.to_string()),
        }
    }

    /// Parses a GeoJSON `crs.properties.name` value such as
    /// `urn:ogc:def:crs:EPSG::3826`, `EPSG:3857` or `urn:ogc:def:crs:OGC:1.3:CRS84`.
    pub fn from_name(name: &str) -> Option<Crs> {
        let name = name.trim();
        if name.to_ascii_uppercase().ends_with("CRS84") {
            return Some(Crs::Epsg(EPSG_WGS84));
        }
        URN_EPSG
            .captures(name)
            .and_then(|c| c[1].parse::<u32>().ok())
            .map(Crs::Epsg)
    }

    pub fn is_wgs84(&self) -> bool {
        match self {
            Crs::Epsg(code) => *code == EPSG_WGS84,
            Crs::Wkt(_) => false,
        }
    }
}

fn is_projected_wkt(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.starts_with("PROJCS") || upper.starts_with("PROJCRS")
}

/// Converts a single coordinate into EPSG:4326 lon/lat.
pub trait Reprojector {
    fn to_wgs84(&self, coord: Coord<f64>) -> Result<Coord<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub semi_major: f64,
    pub inverse_flattening: f64,
}

pub const GRS80: Ellipsoid = Ellipsoid { semi_major: 6_378_137.0, inverse_flattening: 298.257_222_101 };
pub const WGS84: Ellipsoid = Ellipsoid { semi_major: 6_378_137.0, inverse_flattening: 298.257_223_563 };

impl Ellipsoid {
    fn eccentricity_squared(&self) -> f64 {
        let f = 1.0 / self.inverse_flattening;
        2.0 * f - f * f
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransverseMercator {
    pub central_meridian: f64,
    pub latitude_of_origin: f64,
    pub scale_factor: f64,
    /// False easting/northing are in the CRS's linear unit.
    pub false_easting: f64,
    pub false_northing: f64,
    /// Metres per linear unit of the projected coordinates.
    pub linear_unit: f64,
    pub ellipsoid: Ellipsoid,
}

impl TransverseMercator {
    /// TWD97 TM2 with the given central meridian (121 for EPSG:3826, 119 for 3825).
    pub fn twd97(central_meridian: f64) -> Self {
        Self {
            central_meridian,
            latitude_of_origin: 0.0,
            scale_factor: 0.9999,
            false_easting: 250_000.0,
            false_northing: 0.0,
            linear_unit: 1.0,
            ellipsoid: GRS80,
        }
    }

    pub fn utm(zone: u32, south: bool) -> Self {
        Self {
            central_meridian: -183.0 + 6.0 * zone as f64,
            latitude_of_origin: 0.0,
            scale_factor: 0.9996,
            false_easting: 500_000.0,
            false_northing: if south { 10_000_000.0 } else { 0.0 },
            linear_unit: 1.0,
            ellipsoid: WGS84,
        }
    }

    /// Meridian arc length from the equator to `phi` (radians).
    fn meridian_arc(&self, phi: f64) -> f64 {
        let a = self.ellipsoid.semi_major;
        let e2 = self.ellipsoid.eccentricity_squared();
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        a * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
    }

    /// Inverse projection, Snyder (1987) eqs. 8-18 to 8-25.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let a = self.ellipsoid.semi_major;
        let e2 = self.ellipsoid.eccentricity_squared();
        let ep2 = e2 / (1.0 - e2);
        let k0 = self.scale_factor;

        let easting = (x - self.false_easting) * self.linear_unit;
        let northing = (y - self.false_northing) * self.linear_unit;

        let m = self.meridian_arc(self.latitude_of_origin.to_radians()) + northing / k0;
        let mu = m / (a * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));
        let sqrt_1_e2 = (1.0 - e2).sqrt();
        let e1 = (1.0 - sqrt_1_e2) / (1.0 + sqrt_1_e2);

        let phi1 = mu
            + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
            + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
            + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
            + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

        let (sin1, cos1) = phi1.sin_cos();
        let tan1 = phi1.tan();
        let c1 = ep2 * cos1 * cos1;
        let t1 = tan1 * tan1;
        let n1 = a / (1.0 - e2 * sin1 * sin1).sqrt();
        let r1 = a * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
        let d = easting / (n1 * k0);

        let lat = phi1
            - (n1 * tan1 / r1)
                * (d * d / 2.0
                    - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                    + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                        * d.powi(6)
                        / 720.0);
        let lon = self.central_meridian.to_radians()
            + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
                + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
                    / 120.0)
                / cos1;

        (lon.to_degrees(), lat.to_degrees())
    }
}

const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

/// Projections the built-in reprojector can invert.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Geographic,
    WebMercator,
    TransverseMercator(TransverseMercator),
}

impl Projection {
    pub fn resolve(crs: &Crs) -> Result<Projection> {
        match crs {
            Crs::Epsg(code) => Self::from_epsg(*code).ok_or_else(|| PipelineError::Crs {
                crs: crs.to_string(),
                reason: "not supported by the built-in reprojector (build with the `proj` feature)".into(),
            }),
            Crs::Wkt(wkt) => Self::from_wkt(wkt).map_err(|reason| PipelineError::Crs {
                crs: crs.to_string(),
                reason,
            }),
        }
    }

    fn from_epsg(code: u32) -> Option<Projection> {
        match code {
            // WGS84 and TWD97 geographic differ by well under a meter.
            4326 | 3824 | 4269 | 4258 => Some(Projection::Geographic),
            3857 | 900913 => Some(Projection::WebMercator),
            3826 => Some(Projection::TransverseMercator(TransverseMercator::twd97(121.0))),
            3825 => Some(Projection::TransverseMercator(TransverseMercator::twd97(119.0))),
            32601..=32660 => Some(Projection::TransverseMercator(TransverseMercator::utm(code - 32600, false))),
            32701..=32760 => Some(Projection::TransverseMercator(TransverseMercator::utm(code - 32700, true))),
            _ => None,
        }
    }

    fn from_wkt(wkt: &str) -> std::result::Result<Projection, String> {
        let upper = wkt.to_ascii_uppercase();
        if !is_projected_wkt(wkt) {
            let known_datum = ["WGS_1984", "WGS 84", "WGS84", "GRS_1980", "GRS 1980", "TWD_1997", "TWD97"]
                .iter()
                .any(|d| upper.contains(d));
            return if known_datum {
                Ok(Projection::Geographic)
            } else {
                Err("unrecognised geographic datum".into())
            };
        }

        let unit = linear_unit(wkt)?;
        if upper.contains("MERCATOR_AUXILIARY_SPHERE") || upper.contains("PSEUDO-MERCATOR")
            || upper.contains("POPULAR VISUALISATION")
        {
            if (unit - 1.0).abs() > 1e-12 {
                return Err(format!("Web Mercator in a non-metre unit ({}) is not supported", unit));
            }
            return Ok(Projection::WebMercator);
        }
        if upper.contains("TRANSVERSE_MERCATOR") || upper.contains("TRANSVERSE MERCATOR") {
            return Ok(Projection::TransverseMercator(parse_tm_parameters(wkt, unit)));
        }
        Err("unrecognised WKT projection".into())
    }
}

/// Metres per unit of a projected WKT. The projected CRS's own UNIT closes
/// the definition, after the GEOGCS angular unit and the parameters.
fn linear_unit(wkt: &str) -> std::result::Result<f64, String> {
    let Some(caps) = LINEAR_UNIT.captures_iter(wkt).last() else {
        return Err("projected WKT declares no linear unit".into());
    };
    match caps[2].parse::<f64>() {
        Ok(factor) if factor > 0.0 && factor.is_finite() => Ok(factor),
        _ => Err(format!("invalid linear unit {:?}", &caps[0])),
    }
}

fn parse_tm_parameters(wkt: &str, linear_unit: f64) -> TransverseMercator {
    let mut tm = TransverseMercator {
        central_meridian: 0.0,
        latitude_of_origin: 0.0,
        scale_factor: 1.0,
        false_easting: 0.0,
        false_northing: 0.0,
        linear_unit,
        ellipsoid: WGS84,
    };
    for caps in PARAMETER.captures_iter(wkt) {
        let Ok(value) = caps[2].parse::<f64>() else { continue };
        match caps[1].to_ascii_lowercase().replace(' ', "_").as_str() {
            "central_meridian" | "longitude_of_natural_origin" => tm.central_meridian = value,
            "latitude_of_origin" | "latitude_of_natural_origin" => tm.latitude_of_origin = value,
            "scale_factor" | "scale_factor_at_natural_origin" => tm.scale_factor = value,
            "false_easting" => tm.false_easting = value,
            "false_northing" => tm.false_northing = value,
            _ => {}
        }
    }
    if let Some(caps) = SPHEROID.captures(wkt) {
        if let (Ok(a), Ok(rf)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) {
            if a > 0.0 && rf > 0.0 {
                tm.ellipsoid = Ellipsoid { semi_major: a, inverse_flattening: rf };
            }
        }
    }
    tm
}

impl Reprojector for Projection {
    fn to_wgs84(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        let (x, y) = match self {
            Projection::Geographic => (c.x, c.y),
            Projection::WebMercator => {
                let lon = (c.x / WEB_MERCATOR_RADIUS).to_degrees();
                let lat = (2.0 * (c.y / WEB_MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
                (lon, lat)
            }
            Projection::TransverseMercator(tm) => tm.inverse(c.x, c.y),
        };
        Ok(Coord { x, y })
    }
}

#[cfg(feature = "proj")]
pub struct ProjReprojector {
    source: String,
    proj: proj::Proj,
}

#[cfg(feature = "proj")]
impl ProjReprojector {
    pub fn new(crs: &Crs) -> Result<Self> {
        let source = match crs {
            Crs::Epsg(code) => format!("EPSG:{}", code),
            Crs::Wkt(wkt) => wkt.clone(),
        };
        let proj = proj::Proj::new_known_crs(&source, "EPSG:4326", None).map_err(|e| PipelineError::Crs {
            crs: crs.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { source, proj })
    }
}

#[cfg(feature = "proj")]
impl Reprojector for ProjReprojector {
    fn to_wgs84(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        let (x, y) = self.proj.convert((c.x, c.y)).map_err(|e| PipelineError::Crs {
            crs: self.source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Coord { x, y })
    }
}

/// Picks the reprojector for a declared CRS.
#[cfg(feature = "proj")]
pub fn reprojector_for(crs: &Crs) -> Result<Box<dyn Reprojector>> {
    Ok(Box::new(ProjReprojector::new(crs)?))
}

#[cfg(not(feature = "proj"))]
pub fn reprojector_for(crs: &Crs) -> Result<Box<dyn Reprojector>> {
    Ok(Box::new(Projection::resolve(crs)?))
}

/// Brings a layer into EPSG:4326. Layers without a declared CRS are assumed
/// to be WGS84 already and pass through untouched.
pub fn normalize(layer: VectorLayer) -> Result<VectorLayer> {
    let crs = match &layer.crs {
        None => {
            warn!("Layer declares no CRS, assuming EPSG:4326");
            return Ok(layer);
        }
        Some(crs) if crs.is_wgs84() => {
            debug!("Layer already in EPSG:4326");
            return Ok(layer);
        }
        Some(crs) => crs.clone(),
    };

    info!(%crs, features = layer.features.len(), "Reprojecting to EPSG:4326");
    let reprojector = reprojector_for(&crs)?;
    normalize_with(layer, reprojector.as_ref())
}

pub fn normalize_with(mut layer: VectorLayer, reprojector: &dyn Reprojector) -> Result<VectorLayer> {
    for feature in &mut layer.features {
        feature.geometry = feature.geometry.try_map_coords(|c| reprojector.to_wgs84(c))?;
    }
    layer.crs = Some(Crs::Epsg(EPSG_WGS84));
    Ok(layer)
}
