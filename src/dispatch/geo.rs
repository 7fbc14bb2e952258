use crate::models::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// City-traffic speed used for every ETA estimate.
pub const AVERAGE_SPEED_KMH: f64 = 30.0;

const BASE_FARE: f64 = 5.0;
const RATE_PER_KM: f64 = 2.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Whole minutes to cover `distance_km`, never less than one.
pub fn eta_minutes(distance_km: f64) -> i32 {
    let minutes = (distance_km / AVERAGE_SPEED_KMH * 60.0) as i32;
    minutes.max(1)
}

pub fn estimate_price(distance_km: f64) -> f64 {
    BASE_FARE + distance_km * RATE_PER_KM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_degree_of_longitude_at_equator() {
        let d = haversine_km(GeoPoint { lat: 0.0, lng: 0.0 }, GeoPoint { lat: 0.0, lng: 1.0 });
        assert!((d - 111.19).abs() < 0.05, "got {d}");
    }

    #[test]
    fn test_same_point_is_zero_distance() {
        let p = GeoPoint { lat: -1.28, lng: 36.82 };
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn test_eta_has_a_one_minute_floor() {
        assert_eq!(eta_minutes(0.0), 1);
        assert_eq!(eta_minutes(15.0), 30);
    }

    #[test]
    fn test_price_is_base_plus_distance() {
        assert_eq!(estimate_price(0.0), 5.0);
        assert_eq!(estimate_price(10.0), 25.0);
    }
}
