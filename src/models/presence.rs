use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::ride::GeoPoint;
use super::UserId;

/// Latest known location and availability of one driver.
///
/// `is_available` implies `is_online`; every mutation below preserves that.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DriverPresence {
    pub driver_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    pub is_online: bool,
    pub is_available: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Offline,
    Available,
    Busy,
}

impl DriverPresence {
    /// First sighting of a driver: online, not yet taking rides.
    pub fn new(driver_id: UserId, point: GeoPoint, heading: f64, now: DateTime<Utc>) -> Self {
        Self {
            driver_id,
            latitude: point.lat,
            longitude: point.lng,
            heading,
            is_online: true,
            is_available: false,
            last_seen: now,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lng: self.longitude,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        self.is_online && self.is_available
    }

    pub fn status(&self) -> DriverStatus {
        match (self.is_online, self.is_available) {
            (false, _) => DriverStatus::Offline,
            (true, true) => DriverStatus::Available,
            (true, false) => DriverStatus::Busy,
        }
    }

    pub fn moved_to(&mut self, point: GeoPoint, heading: f64, now: DateTime<Utc>) {
        self.latitude = point.lat;
        self.longitude = point.lng;
        self.heading = heading;
        self.is_online = true;
        self.last_seen = now;
    }

    pub fn set_available(&mut self, available: bool, now: DateTime<Utc>) {
        self.is_available = available;
        if available {
            self.is_online = true;
        }
        self.last_seen = now;
    }

    /// Hands the driver back to the pool after a ride ends.
    pub fn release(&mut self) {
        self.is_available = self.is_online;
    }

    pub fn go_offline(&mut self, now: DateTime<Utc>) {
        self.is_online = false;
        self.is_available = false;
        self.last_seen = now;
    }
}
