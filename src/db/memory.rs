use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::debug;

use super::{ApplyFn, DispatchStore, DriverLock};
use crate::dispatch::machine::Transition;
use crate::error::DispatchError;
use crate::models::{
    DriverPresence, GeoPoint, Page, RideId, RideRequest, Role, TripCompletion, TripRating,
    UserId,
};

struct RideRecord {
    ride: RideRequest,
    completion: Option<TripCompletion>,
}

/// In-process store: one async mutex per ride and per driver.
///
/// `active` indexes each driver's accepted, arrived or started rides and
/// `history` each party's completed rides; both change only while the
/// ride's lock is held.
pub struct MemoryStore {
    rides: DashMap<RideId, Arc<Mutex<RideRecord>>>,
    drivers: DashMap<UserId, Arc<Mutex<DriverPresence>>>,
    active: DashMap<UserId, HashSet<RideId>>,
    history: DashMap<(Role, UserId), Vec<RideId>>,
    lock_wait: Duration,
}

impl MemoryStore {
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            rides: DashMap::new(),
            drivers: DashMap::new(),
            active: DashMap::new(),
            history: DashMap::new(),
            lock_wait,
        }
    }

    fn has_active_ride(&self, driver_id: UserId) -> bool {
        self.active
            .get(&driver_id)
            .map(|rides| !rides.is_empty())
            .unwrap_or(false)
    }

    fn reindex(&self, before: &RideRequest, after: &RideRequest) {
        if let Some(driver_id) = before.driver_id.filter(|_| before.status.is_active()) {
            if !(after.is_bound_to(driver_id) && after.status.is_active()) {
                if let Some(mut rides) = self.active.get_mut(&driver_id) {
                    rides.remove(&before.id);
                }
                self.active
                    .remove_if(&driver_id, |_, rides| rides.is_empty());
            }
        }
        if let Some(driver_id) = after.driver_id.filter(|_| after.status.is_active()) {
            self.active.entry(driver_id).or_default().insert(after.id);
        }
    }

    fn record_history(&self, completion: &TripCompletion) {
        for key in [
            (Role::Driver, completion.driver_id),
            (Role::Client, completion.client_id),
        ] {
            self.history.entry(key).or_default().push(completion.ride_id);
        }
    }

    async fn lock<T>(&self, cell: Arc<Mutex<T>>) -> Result<OwnedMutexGuard<T>, DispatchError> {
        timeout(self.lock_wait, cell.lock_owned())
            .await
            .map_err(|_| DispatchError::Busy)
    }

    // Map guards must not be held across an await.
    fn ride_cell(&self, ride_id: RideId) -> Option<Arc<Mutex<RideRecord>>> {
        self.rides.get(&ride_id).map(|e| e.value().clone())
    }

    fn driver_cell(&self, driver_id: UserId) -> Option<Arc<Mutex<DriverPresence>>> {
        self.drivers.get(&driver_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn insert_ride(&self, ride: &RideRequest) -> Result<(), DispatchError> {
        match self.rides.entry(ride.id) {
            Entry::Occupied(_) => Err(DispatchError::Conflict("ride already exists".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(RideRecord {
                    ride: ride.clone(),
                    completion: None,
                })));
                Ok(())
            }
        }
    }

    async fn ride(&self, ride_id: RideId) -> Result<Option<RideRequest>, DispatchError> {
        let Some(cell) = self.ride_cell(ride_id) else {
            return Ok(None);
        };
        let record = self.lock(cell).await?;
        Ok(Some(record.ride.clone()))
    }

    async fn transition(
        &self,
        ride_id: RideId,
        lock: DriverLock,
        apply: ApplyFn,
    ) -> Result<Transition, DispatchError> {
        let cell = self.ride_cell(ride_id).ok_or(DispatchError::NotFound("ride"))?;
        let mut record = self.lock(cell).await?;

        let mut driver = match lock.resolve(&record.ride).and_then(|id| self.driver_cell(id)) {
            Some(cell) => Some(self.lock(cell).await?),
            None => None,
        };

        let transition = apply(&record.ride, driver.as_deref(), record.completion.as_ref())?;

        if transition.completion.is_some() && record.completion.is_some() {
            return Err(DispatchError::Conflict("trip already completed".to_string()));
        }

        // Both locks are held until every write below has landed.
        if let (Some(guard), Some(next)) = (driver.as_mut(), transition.presence.as_ref()) {
            if guard.driver_id == next.driver_id {
                **guard = next.clone();
            }
        }
        self.reindex(&record.ride, &transition.ride);
        record.ride = transition.ride.clone();
        if let Some(completion) = &transition.completion {
            self.record_history(completion);
            record.completion = Some(completion.clone());
        }

        Ok(transition)
    }

    async fn upsert_location(
        &self,
        driver_id: UserId,
        point: GeoPoint,
        heading: f64,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError> {
        let cell = self
            .drivers
            .entry(driver_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(DriverPresence::new(driver_id, point, heading, now)))
            })
            .value()
            .clone();

        let mut presence = self.lock(cell).await?;
        presence.moved_to(point, heading, now);
        Ok(presence.clone())
    }

    async fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError> {
        let cell = self
            .driver_cell(driver_id)
            .ok_or(DispatchError::NotFound("driver presence"))?;
        let mut presence = self.lock(cell).await?;
        // Accepts and releases update the index under this same lock.
        if available && self.has_active_ride(driver_id) {
            return Err(DispatchError::invalid_state("driver has an active ride"));
        }
        presence.set_available(available, now);
        Ok(presence.clone())
    }

    async fn mark_offline(
        &self,
        driver_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DriverPresence>, DispatchError> {
        let Some(cell) = self.driver_cell(driver_id) else {
            return Ok(None);
        };
        let mut presence = self.lock(cell).await?;
        presence.go_offline(now);
        Ok(Some(presence.clone()))
    }

    async fn presence(&self, driver_id: UserId) -> Result<Option<DriverPresence>, DispatchError> {
        let Some(cell) = self.driver_cell(driver_id) else {
            return Ok(None);
        };
        let presence = self.lock(cell).await?;
        Ok(Some(presence.clone()))
    }

    async fn available_presences(&self) -> Result<Vec<DriverPresence>, DispatchError> {
        let cells: Vec<_> = self.drivers.iter().map(|e| e.value().clone()).collect();
        let mut available = Vec::new();
        let mut skipped = 0;
        for cell in cells {
            // A driver locked mid-update is about to change; leave it out.
            match cell.try_lock() {
                Ok(presence) if presence.is_dispatchable() => available.push(presence.clone()),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "Skipped locked driver presences");
        }
        Ok(available)
    }

    async fn active_rides_for_driver(
        &self,
        driver_id: UserId,
    ) -> Result<Vec<RideRequest>, DispatchError> {
        let ids: Vec<RideId> = self
            .active
            .get(&driver_id)
            .map(|rides| rides.iter().copied().collect())
            .unwrap_or_default();
        let mut rides = Vec::new();
        for cell in ids.into_iter().filter_map(|id| self.ride_cell(id)) {
            let record = self.lock(cell).await?;
            if record.ride.is_bound_to(driver_id) && record.ride.status.is_active() {
                rides.push(record.ride.clone());
            }
        }
        rides.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rides)
    }

    async fn completion(&self, ride_id: RideId) -> Result<Option<TripCompletion>, DispatchError> {
        let Some(cell) = self.ride_cell(ride_id) else {
            return Ok(None);
        };
        let record = self.lock(cell).await?;
        Ok(record.completion.clone())
    }

    async fn rate_trip(
        &self,
        ride_id: RideId,
        rater: Role,
        rating: &TripRating,
    ) -> Result<TripCompletion, DispatchError> {
        let cell = self
            .ride_cell(ride_id)
            .ok_or(DispatchError::NotFound("trip completion"))?;
        let mut record = self.lock(cell).await?;
        let completion = record
            .completion
            .as_mut()
            .ok_or(DispatchError::NotFound("trip completion"))?;
        completion.rate(rater, rating);
        Ok(completion.clone())
    }

    async fn completions_for(
        &self,
        role: Role,
        user_id: UserId,
        page: Page,
    ) -> Result<(Vec<TripCompletion>, i64), DispatchError> {
        let ids = self
            .history
            .get(&(role, user_id))
            .map(|rides| rides.value().clone())
            .unwrap_or_default();
        let mut completions = Vec::with_capacity(ids.len());
        // Newest recorded first so equal timestamps keep that order below.
        for cell in ids.into_iter().rev().filter_map(|id| self.ride_cell(id)) {
            let record = self.lock(cell).await?;
            if let Some(completion) = &record.completion {
                completions.push(completion.clone());
            }
        }
        completions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = completions.len() as i64;
        let completions = completions
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok((completions, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::apply_with;
    use crate::dispatch::machine::{self, tests::pending_ride};
    use crate::models::{Actor, RideStatus, TripActuals};
    use uuid::Uuid;

    async fn available(store: &MemoryStore, driver_id: UserId) {
        store
            .upsert_location(driver_id, GeoPoint { lat: 0.0, lng: 0.001 }, 0.0, Utc::now())
            .await
            .unwrap();
        store
            .set_availability(driver_id, true, Utc::now())
            .await
            .unwrap();
    }

    fn accept_as(driver_id: UserId) -> ApplyFn {
        apply_with(move |ride, presence, _| {
            machine::accept(ride, Actor::Driver(driver_id), presence, Utc::now())
        })
    }

    /// Accepts, starts and completes `ride` as `driver_id`.
    async fn finish(store: &MemoryStore, ride: &RideRequest, driver_id: UserId, fare: f64) {
        store.insert_ride(ride).await.unwrap();
        store
            .transition(ride.id, DriverLock::Actor(driver_id), accept_as(driver_id))
            .await
            .unwrap();
        store
            .transition(
                ride.id,
                DriverLock::None,
                apply_with(move |ride, _, _| {
                    machine::start(ride, Actor::Driver(driver_id), Utc::now())
                }),
            )
            .await
            .unwrap();
        let actuals = TripActuals {
            actual_fare: fare,
            actual_distance: 1.0,
            actual_duration: 3,
            driver_notes: None,
        };
        store
            .transition(
                ride.id,
                DriverLock::Bound,
                apply_with(move |ride, presence, existing| {
                    machine::complete(
                        ride,
                        Actor::Driver(driver_id),
                        presence,
                        existing,
                        &actuals,
                        Utc::now(),
                    )
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accepts_bind_exactly_one_driver() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(2)));
        let ride = pending_ride(Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();

        let drivers: Vec<UserId> = (0..8).map(|_| Uuid::new_v4()).collect();
        for d in &drivers {
            available(&store, *d).await;
        }

        let ride_id = ride.id;
        let handles: Vec<_> = drivers
            .iter()
            .map(|d| {
                let store = store.clone();
                let d = *d;
                tokio::spawn(async move {
                    store
                        .transition(ride_id, DriverLock::Actor(d), accept_as(d))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert_eq!(e, DispatchError::invalid_state("ride is no longer available")),
            }
        }
        assert_eq!(winners, 1);

        let stored = store.ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Accepted);
        let winner = stored.driver_id.unwrap();

        for d in &drivers {
            let p = store.presence(*d).await.unwrap().unwrap();
            assert_eq!(p.is_available, *d != winner);
        }
    }

    #[tokio::test]
    async fn test_lock_wait_past_bound_is_busy() {
        let store = MemoryStore::new(Duration::from_millis(20));
        let ride = pending_ride(Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();

        let _held = store.ride_cell(ride.id).unwrap().lock_owned().await;

        assert_eq!(store.ride(ride.id).await, Err(DispatchError::Busy));
        let driver = Uuid::new_v4();
        assert_eq!(
            store
                .transition(ride.id, DriverLock::Actor(driver), accept_as(driver))
                .await,
            Err(DispatchError::Busy)
        );
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_records_untouched() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        available(&store, driver).await;
        let ride = pending_ride(Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();
        let before = store.presence(driver).await.unwrap();

        let actuals = TripActuals {
            actual_fare: 9.0,
            actual_distance: 1.0,
            actual_duration: 3,
            driver_notes: None,
        };
        let result = store
            .transition(
                ride.id,
                DriverLock::Actor(driver),
                apply_with(move |ride, presence, existing| {
                    machine::complete(
                        ride,
                        Actor::Driver(driver),
                        presence,
                        existing,
                        &actuals,
                        Utc::now(),
                    )
                }),
            )
            .await;

        assert_eq!(result, Err(DispatchError::Unauthorized));
        assert_eq!(store.ride(ride.id).await.unwrap(), Some(ride.clone()));
        assert_eq!(store.presence(driver).await.unwrap(), before);
        assert_eq!(store.completion(ride.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_ride_is_not_found() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        assert_eq!(
            store
                .transition(Uuid::new_v4(), DriverLock::Actor(driver), accept_as(driver))
                .await,
            Err(DispatchError::NotFound("ride"))
        );
    }

    #[tokio::test]
    async fn test_presence_lifecycle() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();

        assert_eq!(
            store.set_availability(driver, true, Utc::now()).await,
            Err(DispatchError::NotFound("driver presence"))
        );
        assert_eq!(store.mark_offline(driver, Utc::now()).await, Ok(None));

        let first = store
            .upsert_location(driver, GeoPoint { lat: 1.0, lng: 1.0 }, 45.0, Utc::now())
            .await
            .unwrap();
        assert!(first.is_online && !first.is_available);
        assert!(store.available_presences().await.unwrap().is_empty());

        store.set_availability(driver, true, Utc::now()).await.unwrap();
        assert_eq!(store.available_presences().await.unwrap().len(), 1);

        let offline = store.mark_offline(driver, Utc::now()).await.unwrap().unwrap();
        assert!(!offline.is_online && !offline.is_available);
        assert!(store.available_presences().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_rides_and_rating() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        available(&store, driver).await;
        let ride = pending_ride(Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();
        store
            .transition(ride.id, DriverLock::Actor(driver), accept_as(driver))
            .await
            .unwrap();

        let active = store.active_rides_for_driver(driver).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, ride.id);

        assert_eq!(
            store
                .rate_trip(ride.id, Role::Client, &TripRating { rating: 5.0, notes: None })
                .await,
            Err(DispatchError::NotFound("trip completion"))
        );
    }

    #[tokio::test]
    async fn test_bound_driver_cannot_become_available() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        available(&store, driver).await;
        let first = pending_ride(Uuid::new_v4());
        store.insert_ride(&first).await.unwrap();
        store
            .transition(first.id, DriverLock::Actor(driver), accept_as(driver))
            .await
            .unwrap();

        assert_eq!(
            store.set_availability(driver, true, Utc::now()).await,
            Err(DispatchError::invalid_state("driver has an active ride"))
        );
        assert!(!store.presence(driver).await.unwrap().unwrap().is_available);

        let second = pending_ride(Uuid::new_v4());
        store.insert_ride(&second).await.unwrap();
        assert!(matches!(
            store
                .transition(second.id, DriverLock::Actor(driver), accept_as(driver))
                .await,
            Err(DispatchError::InvalidState(_))
        ));
        assert_eq!(store.active_rides_for_driver(driver).await.unwrap().len(), 1);

        // Going unavailable is always allowed.
        store.set_availability(driver, false, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_reopens_availability() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        available(&store, driver).await;
        finish(&store, &pending_ride(Uuid::new_v4()), driver, 10.0).await;

        assert!(store.active_rides_for_driver(driver).await.unwrap().is_empty());
        store.set_availability(driver, false, Utc::now()).await.unwrap();
        assert!(store
            .set_availability(driver, true, Utc::now())
            .await
            .unwrap()
            .is_available);
    }

    #[tokio::test]
    async fn test_reads_are_not_blocked_by_unrelated_locks() {
        let store = MemoryStore::new(Duration::from_millis(20));
        let busy_driver = Uuid::new_v4();
        let idle_driver = Uuid::new_v4();
        available(&store, busy_driver).await;
        available(&store, idle_driver).await;

        let ride = pending_ride(Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();
        store
            .transition(ride.id, DriverLock::Actor(busy_driver), accept_as(busy_driver))
            .await
            .unwrap();
        let other = pending_ride(Uuid::new_v4());
        store.insert_ride(&other).await.unwrap();

        let _ride_held = store.ride_cell(other.id).unwrap().lock_owned().await;
        assert_eq!(store.active_rides_for_driver(idle_driver).await, Ok(Vec::new()));
        assert_eq!(store.active_rides_for_driver(busy_driver).await.unwrap().len(), 1);

        store.set_availability(busy_driver, false, Utc::now()).await.unwrap();
        let third = Uuid::new_v4();
        available(&store, third).await;
        let _driver_held = store.driver_cell(third).unwrap().lock_owned().await;
        let pool = store.available_presences().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].driver_id, idle_driver);
    }

    #[tokio::test]
    async fn test_completions_are_paged_newest_first() {
        let store = MemoryStore::new(Duration::from_secs(1));
        let driver = Uuid::new_v4();
        let client = Uuid::new_v4();
        available(&store, driver).await;
        for fare in [1.0, 2.0, 3.0] {
            finish(&store, &pending_ride(client), driver, fare).await;
        }
        finish(&store, &pending_ride(Uuid::new_v4()), driver, 4.0).await;

        let (page, total) = store
            .completions_for(Role::Driver, driver, Page { page: 1, limit: 3 })
            .await
            .unwrap();
        assert_eq!(total, 4);
        let fares: Vec<f64> = page.iter().map(|c| c.actual_fare).collect();
        assert_eq!(fares, vec![4.0, 3.0, 2.0]);

        let (rest, _) = store
            .completions_for(Role::Driver, driver, Page { page: 2, limit: 3 })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].actual_fare, 1.0);

        let (mine, total) = store
            .completions_for(Role::Client, client, Page { page: 1, limit: 10 })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert!(mine.iter().all(|c| c.client_id == client));

        assert_eq!(
            store
                .completions_for(Role::Client, driver, Page { page: 1, limit: 10 })
                .await,
            Ok((Vec::new(), 0))
        );
    }
}
