//! Great-circle distance for emergency corroboration.

use nexus_common::Location;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometres.
pub fn haversine_km(a: &Location, b: &Location) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Whether two locations are within `radius_km` of each other.
pub fn is_in_proximity(a: &Location, b: &Location, radius_km: f64) -> bool {
    haversine_km(a, b) <= radius_km
}
