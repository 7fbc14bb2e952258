//! Ride dispatch: the entry point for every ride and driver operation.
//!
//! Each call authorizes the actor, runs the guarded transition against the
//! store under the ride's lock and hands the committed outcome to the
//! notifier.

pub mod geo;
pub mod machine;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{apply_with, retry_read, DispatchStore, DriverLock};
use crate::error::DispatchError;
use crate::models::{
    Actor, DriverPresence, GeoPoint, Page, Place, RideId, RideRequest, RideStatus, Role,
    TripActuals, TripCompletion, TripHistory, TripRating, UserId,
};
use crate::notifier::EventNotifier;
use crate::presence::{NearbyDriver, PresenceTracker};
use machine::Transition;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Kilometres around the pickup searched for drivers.
    pub radius_km: f64,
    pub read_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRide {
    pub pickup: Place,
    pub destination: Place,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideDispatch {
    #[serde(flatten)]
    pub ride: RideRequest,
    pub nearby_drivers: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DispatchStore>,
    presence: PresenceTracker,
    notifier: EventNotifier,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        notifier: EventNotifier,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            presence: PresenceTracker::new(Arc::clone(&store), settings.read_retries),
            store,
            notifier,
            settings,
        }
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Creates a pending ride and offers it to available drivers nearby.
    /// Finding or notifying drivers never fails the request.
    pub async fn request_ride(
        &self,
        actor: Actor,
        request: NewRide,
    ) -> Result<RideDispatch, DispatchError> {
        let Actor::Client(client_id) = actor else {
            return Err(DispatchError::Unauthorized);
        };
        let pickup = request.pickup.point();
        let destination = request.destination.point();
        pickup.validate()?;
        destination.validate()?;

        let distance = geo::haversine_km(pickup, destination);
        let now = Utc::now();
        let ride = RideRequest {
            id: Uuid::new_v4(),
            client_id,
            driver_id: None,
            pickup: request.pickup,
            destination: request.destination,
            status: RideStatus::Pending,
            price: geo::estimate_price(distance),
            distance,
            duration: geo::eta_minutes(distance),
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_ride(&ride).await?;
        info!(ride_id = %ride.id, client_id = %client_id, distance_km = distance, "Ride requested");

        let nearby = match self.presence.nearby(pickup, self.settings.radius_km).await {
            Ok(drivers) => drivers,
            Err(e) => {
                warn!(ride_id = %ride.id, "Nearby driver lookup failed: {}", e);
                Vec::new()
            }
        };
        self.notifier.ride_requested(&ride, &nearby);

        Ok(RideDispatch {
            ride,
            nearby_drivers: nearby.len(),
        })
    }

    pub async fn accept(&self, actor: Actor, ride_id: RideId) -> Result<Transition, DispatchError> {
        let Actor::Driver(driver_id) = actor else {
            return Err(DispatchError::Unauthorized);
        };
        let apply = apply_with(move |ride, presence, _| {
            machine::accept(ride, actor, presence, Utc::now())
        });
        // A lost race reads the same as any other taken ride.
        self.commit(ride_id, DriverLock::Actor(driver_id), apply)
            .await
            .map_err(|e| match e {
                DispatchError::Conflict(_) => {
                    DispatchError::invalid_state("ride is no longer available")
                }
                other => other,
            })
    }

    pub async fn reject(&self, actor: Actor, ride_id: RideId) -> Result<Transition, DispatchError> {
        let apply = apply_with(move |ride, _, _| machine::reject(ride, actor, Utc::now()));
        self.commit(ride_id, DriverLock::None, apply).await
    }

    pub async fn arrive(&self, actor: Actor, ride_id: RideId) -> Result<Transition, DispatchError> {
        let apply = apply_with(move |ride, _, _| machine::arrive(ride, actor, Utc::now()));
        self.commit(ride_id, DriverLock::None, apply).await
    }

    pub async fn start(&self, actor: Actor, ride_id: RideId) -> Result<Transition, DispatchError> {
        let apply = apply_with(move |ride, _, _| machine::start(ride, actor, Utc::now()));
        self.commit(ride_id, DriverLock::None, apply).await
    }

    pub async fn complete(
        &self,
        actor: Actor,
        ride_id: RideId,
        actuals: TripActuals,
    ) -> Result<Transition, DispatchError> {
        actuals.validate()?;
        let apply = apply_with(move |ride, presence, existing| {
            machine::complete(ride, actor, presence, existing, &actuals, Utc::now())
        });
        self.commit(ride_id, DriverLock::Bound, apply).await
    }

    pub async fn cancel(&self, actor: Actor, ride_id: RideId) -> Result<Transition, DispatchError> {
        let apply = apply_with(move |ride, presence, _| {
            machine::cancel(ride, actor, presence, Utc::now())
        });
        self.commit(ride_id, DriverLock::Bound, apply).await
    }

    /// Generic status change, routed through the guarded transition for the
    /// requested status. Completion needs actuals and has its own call.
    pub async fn update_status(
        &self,
        actor: Actor,
        ride_id: RideId,
        status: RideStatus,
    ) -> Result<Transition, DispatchError> {
        match status {
            RideStatus::Accepted => self.accept(actor, ride_id).await,
            RideStatus::Arrived => self.arrive(actor, ride_id).await,
            RideStatus::Started => self.start(actor, ride_id).await,
            RideStatus::Cancelled => self.cancel(actor, ride_id).await,
            RideStatus::Pending | RideStatus::Completed => Err(DispatchError::invalid_state(
                format!("cannot set status to {}", status),
            )),
        }
    }

    /// The ride as seen by its client, its bound driver, or any driver while
    /// it is still open for acceptance.
    pub async fn ride(&self, actor: Actor, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        let ride = retry_read(self.settings.read_retries, || self.store.ride(ride_id))
            .await?
            .ok_or(DispatchError::NotFound("ride"))?;

        let visible = match actor {
            Actor::Client(id) => ride.client_id == id,
            Actor::Driver(id) => ride.is_bound_to(id) || ride.status == RideStatus::Pending,
        };
        if !visible {
            return Err(DispatchError::Unauthorized);
        }
        Ok(ride)
    }

    pub async fn completion(
        &self,
        actor: Actor,
        ride_id: RideId,
    ) -> Result<TripCompletion, DispatchError> {
        let completion = retry_read(self.settings.read_retries, || self.store.completion(ride_id))
            .await?
            .ok_or(DispatchError::NotFound("trip completion"))?;
        authorize_party(&completion, actor)?;
        Ok(completion)
    }

    pub async fn rate(
        &self,
        actor: Actor,
        ride_id: RideId,
        rating: TripRating,
    ) -> Result<TripCompletion, DispatchError> {
        rating.validate()?;
        self.completion(actor, ride_id).await?;
        let completion = self.store.rate_trip(ride_id, actor.role(), &rating).await?;
        info!(ride_id = %ride_id, rater = %actor.role(), rating = rating.rating, "Trip rated");
        Ok(completion)
    }

    /// Completed trips where the caller was the `role` party, newest first.
    pub async fn trip_history(
        &self,
        actor: Actor,
        role: Role,
        page: Page,
    ) -> Result<TripHistory, DispatchError> {
        if actor.role() != role {
            return Err(DispatchError::Unauthorized);
        }
        let (completions, total) = retry_read(self.settings.read_retries, || {
            self.store.completions_for(role, actor.id(), page)
        })
        .await?;
        Ok(TripHistory::new(completions, page, total))
    }

    /// The calling driver's accepted, arrived or started rides.
    pub async fn assigned_rides(&self, actor: Actor) -> Result<Vec<RideRequest>, DispatchError> {
        let driver_id = driver_only(actor)?;
        retry_read(self.settings.read_retries, || {
            self.store.active_rides_for_driver(driver_id)
        })
        .await
    }

    /// Records a driver's position and forwards it to the client of each
    /// ride the driver is serving.
    pub async fn update_location(
        &self,
        actor: Actor,
        point: GeoPoint,
        heading: f64,
    ) -> Result<DriverPresence, DispatchError> {
        let driver_id = driver_only(actor)?;
        let presence = self.presence.set_location(driver_id, point, heading).await?;

        match self.store.active_rides_for_driver(driver_id).await {
            Ok(rides) => {
                for ride in &rides {
                    self.notifier.driver_location(&presence, ride);
                }
            }
            Err(e) => warn!(driver_id = %driver_id, "Active ride lookup failed: {}", e),
        }
        Ok(presence)
    }

    pub async fn set_availability(
        &self,
        actor: Actor,
        available: bool,
    ) -> Result<DriverPresence, DispatchError> {
        let driver_id = driver_only(actor)?;
        self.presence.set_availability(driver_id, available).await
    }

    pub async fn driver_status(&self, actor: Actor) -> Result<DriverPresence, DispatchError> {
        let driver_id = driver_only(actor)?;
        self.presence.get(driver_id).await
    }

    pub async fn nearby_drivers(
        &self,
        point: GeoPoint,
        radius_km: Option<f64>,
    ) -> Result<Vec<NearbyDriver>, DispatchError> {
        point.validate()?;
        let radius_km = radius_km.unwrap_or(self.settings.radius_km);
        if radius_km.is_nan() || radius_km <= 0.0 {
            return Err(DispatchError::Validation(
                "radius must be positive".to_string(),
            ));
        }
        self.presence.nearby(point, radius_km).await
    }

    /// Soft-offline once a driver's last live connection is gone.
    pub async fn driver_disconnected(&self, driver_id: UserId) {
        if let Err(e) = self.presence.go_offline(driver_id).await {
            warn!(driver_id = %driver_id, "Failed to mark driver offline: {}", e);
        }
    }

    async fn commit(
        &self,
        ride_id: RideId,
        lock: DriverLock,
        apply: crate::db::ApplyFn,
    ) -> Result<Transition, DispatchError> {
        let transition = self.store.transition(ride_id, lock, apply).await?;
        info!(
            ride_id = %ride_id,
            from = %transition.expected,
            to = %transition.ride.status,
            "Ride transitioned"
        );
        self.notifier.transitioned(&transition);
        Ok(transition)
    }
}

fn driver_only(actor: Actor) -> Result<UserId, DispatchError> {
    match actor {
        Actor::Driver(id) => Ok(id),
        Actor::Client(_) => Err(DispatchError::Unauthorized),
    }
}

fn authorize_party(completion: &TripCompletion, actor: Actor) -> Result<(), DispatchError> {
    let party = match actor {
        Actor::Client(id) => completion.client_id == id,
        Actor::Driver(id) => completion.driver_id == id,
    };
    if party {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized)
    }
}
