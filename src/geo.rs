//! Great-circle distance helpers.
//!
//! Visibility and broadcast-range checks throughout the session protocol
//! compare distances in nautical miles, so this wraps the haversine
//! formula with that unit baked in rather than converting at every call
//! site.

const EARTH_RADIUS_NM: f64 = 3440.065;

/// Latitude/longitude in degrees, altitude ignored (range checks in this
/// protocol are all horizontal).
pub fn haversine_distance_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_NM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_between_identical_points() {
        assert!(haversine_distance_nm(51.5, -0.1, 51.5, -0.1) < 1e-9);
    }

    #[test]
    fn roughly_matches_known_distance() {
        // London to Paris is about 190nm.
        let distance = haversine_distance_nm(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((distance - 190.0).abs() < 15.0, "distance was {distance}");
    }
}
