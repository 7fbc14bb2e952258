//! Driver presence: latest location and availability per driver.
//!
//! Same-driver writes are serialized by the store; reads go through the
//! bounded retry used for every idempotent store read.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{retry_read, DispatchStore};
use crate::dispatch::geo;
use crate::error::DispatchError;
use crate::models::{DriverPresence, GeoPoint, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyDriver {
    #[serde(flatten)]
    pub presence: DriverPresence,
    pub distance_km: f64,
    pub eta_minutes: i32,
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn DispatchStore>,
    read_retries: u32,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn DispatchStore>, read_retries: u32) -> Self {
        Self {
            store,
            read_retries,
        }
    }

    /// Upserts the driver's record and marks it online.
    pub async fn set_location(
        &self,
        driver_id: UserId,
        point: GeoPoint,
        heading: f64,
    ) -> Result<DriverPresence, DispatchError> {
        point.validate()?;
        if !(0.0..360.0).contains(&heading) {
            return Err(DispatchError::Validation(
                "heading must be in [0, 360)".to_string(),
            ));
        }
        let presence = self
            .store
            .upsert_location(driver_id, point, heading, Utc::now())
            .await?;
        debug!(driver_id = %driver_id, lat = point.lat, lng = point.lng, "Driver location updated");
        Ok(presence)
    }

    pub async fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
    ) -> Result<DriverPresence, DispatchError> {
        let presence = self
            .store
            .set_availability(driver_id, available, Utc::now())
            .await?;
        info!(driver_id = %driver_id, available, "Driver availability changed");
        Ok(presence)
    }

    pub async fn get(&self, driver_id: UserId) -> Result<DriverPresence, DispatchError> {
        retry_read(self.read_retries, || self.store.presence(driver_id))
            .await?
            .ok_or(DispatchError::NotFound("driver presence"))
    }

    /// Online, available drivers within `radius_km` of `point`, closest first.
    pub async fn nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<NearbyDriver>, DispatchError> {
        let candidates = retry_read(self.read_retries, || self.store.available_presences()).await?;

        let mut nearby: Vec<NearbyDriver> = candidates
            .into_iter()
            .filter_map(|presence| {
                let distance_km = geo::haversine_km(presence.point(), point);
                (distance_km <= radius_km).then(|| NearbyDriver {
                    presence,
                    distance_km,
                    eta_minutes: geo::eta_minutes(distance_km),
                })
            })
            .collect();
        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        Ok(nearby)
    }

    /// Soft offline. A driver that never reported a location is ignored.
    pub async fn go_offline(
        &self,
        driver_id: UserId,
    ) -> Result<Option<DriverPresence>, DispatchError> {
        let presence = self.store.mark_offline(driver_id, Utc::now()).await?;
        if presence.is_some() {
            info!(driver_id = %driver_id, "Driver went offline");
        }
        Ok(presence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryStore::new(Duration::from_secs(1))), 3)
    }

    #[tokio::test]
    async fn test_set_location_validates_and_upserts() {
        let tracker = tracker();
        let driver = Uuid::new_v4();

        assert!(matches!(
            tracker
                .set_location(driver, GeoPoint { lat: 91.0, lng: 0.0 }, 0.0)
                .await,
            Err(DispatchError::Validation(_))
        ));
        assert_eq!(
            tracker.get(driver).await,
            Err(DispatchError::NotFound("driver presence"))
        );

        tracker
            .set_location(driver, GeoPoint { lat: 1.0, lng: 1.0 }, 10.0)
            .await
            .unwrap();
        let moved = tracker
            .set_location(driver, GeoPoint { lat: 1.5, lng: 1.0 }, 20.0)
            .await
            .unwrap();
        assert_eq!(tracker.get(driver).await.unwrap(), moved);
        assert_eq!(moved.heading, 20.0);
    }

    #[tokio::test]
    async fn test_heading_must_be_a_compass_bearing() {
        let tracker = tracker();
        let driver = Uuid::new_v4();
        let point = GeoPoint { lat: 1.0, lng: 1.0 };

        for heading in [-1.0, 360.0, 1e9, f64::NAN] {
            assert!(matches!(
                tracker.set_location(driver, point, heading).await,
                Err(DispatchError::Validation(_))
            ));
        }
        assert_eq!(
            tracker.get(driver).await,
            Err(DispatchError::NotFound("driver presence"))
        );

        assert_eq!(
            tracker.set_location(driver, point, 359.5).await.unwrap().heading,
            359.5
        );
    }

    #[tokio::test]
    async fn test_availability_requires_existing_record() {
        let tracker = tracker();
        let driver = Uuid::new_v4();

        assert_eq!(
            tracker.set_availability(driver, true).await,
            Err(DispatchError::NotFound("driver presence"))
        );

        tracker
            .set_location(driver, GeoPoint { lat: 0.0, lng: 0.0 }, 0.0)
            .await
            .unwrap();
        assert!(tracker.set_availability(driver, true).await.unwrap().is_available);
    }

    #[tokio::test]
    async fn test_nearby_filters_by_radius_and_availability() {
        let tracker = tracker();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        let busy = Uuid::new_v4();

        for (driver, lng) in [(close, 0.01), (far, 1.0), (busy, 0.02)] {
            tracker
                .set_location(driver, GeoPoint { lat: 0.0, lng }, 0.0)
                .await
                .unwrap();
        }
        tracker.set_availability(close, true).await.unwrap();
        tracker.set_availability(far, true).await.unwrap();

        let found = tracker
            .nearby(GeoPoint { lat: 0.0, lng: 0.0 }, 10.0)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].presence.driver_id, close);
        assert!(found[0].distance_km < 1.2);
    }

    #[tokio::test]
    async fn test_go_offline_drops_driver_from_pool() {
        let tracker = tracker();
        let driver = Uuid::new_v4();
        assert_eq!(tracker.go_offline(driver).await, Ok(None));

        tracker
            .set_location(driver, GeoPoint { lat: 0.0, lng: 0.0 }, 0.0)
            .await
            .unwrap();
        tracker.set_availability(driver, true).await.unwrap();
        tracker.go_offline(driver).await.unwrap();

        let p = tracker.get(driver).await.unwrap();
        assert!(!p.is_online && !p.is_available);
        assert!(tracker
            .nearby(GeoPoint { lat: 0.0, lng: 0.0 }, 10.0)
            .await
            .unwrap()
            .is_empty());
    }
}
