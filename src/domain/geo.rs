//! Great-circle distance and the coarse grid used for cache keys

use crate::domain::types::LocationPoint;
use std::fmt;

/// Mean Earth radius used by the distance test
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points in kilometres
pub fn haversine_km(a: &LocationPoint, b: &LocationPoint) -> f64 {
    let lat1 = a.latitude().to_radians();
    let lat2 = b.latitude().to_radians();
    let d_lat = (b.latitude() - a.latitude()).to_radians();
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Location snapped to a fixed decimal precision.
///
/// At 2 decimals the cell is roughly 1.1 km, so nearby requests share one key.
/// Two distinct origins inside the same cell get the same weather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridKey {
    lat_scaled: i64,
    lon_scaled: i64,
    precision: u32,
}

impl GridKey {
    pub fn new(point: &LocationPoint, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        Self {
            lat_scaled: (point.latitude() * scale).round() as i64,
            lon_scaled: (point.longitude() * scale).round() as i64,
            precision,
        }
    }
}

impl fmt::Display for GridKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 10f64.powi(self.precision as i32);
        let p = self.precision as usize;
        write!(
            f,
            "{:.p$},{:.p$}",
            self.lat_scaled as f64 / scale,
            self.lon_scaled as f64 / scale,
            p = p
        )
    }
}
