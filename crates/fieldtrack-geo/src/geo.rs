use fieldtrack_proto::{Point, Position};

/// Mean Earth radius used for all distance computations.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn distance_between(a: &Position, b: &Position) -> f64 {
    haversine_m(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Total length of a path, summing consecutive pairs.
pub fn path_length_m<'a, I>(points: I) -> f64
where
    I: IntoIterator<Item = &'a Position>,
{
    let mut total = 0.0;
    let mut prev: Option<&Position> = None;
    for p in points {
        if let Some(q) = prev {
            total += distance_between(q, p);
        }
        prev = Some(p);
    }
    total
}

// Ray casting in lon/lat space; fine for fences that don't straddle the antimeridian.
pub fn point_in_polygon(poly: &[Point], lat: f64, lon: f64) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (poly[i].longitude, poly[i].latitude);
        let (xj, yj) = (poly[j].longitude, poly[j].latitude);
        let intersect = ((yi > lat) != (yj > lat))
            && (lon < (xj - xi) * (lat - yi) / (yj - yi + 1e-12) + xi);
        if intersect {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}
