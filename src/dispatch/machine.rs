//! Ride lifecycle transitions.
//!
//! Each function takes the locked snapshot of a ride (plus the driver's
//! presence and any completion record when the transition needs them) and
//! either rejects the call or returns the full post-transition state. Nothing
//! here touches storage; the store applies the returned [`Transition`]
//! atomically while it still holds the locks the snapshot was read under.

use chrono::{DateTime, Utc};

use super::geo;
use crate::error::DispatchError;
use crate::models::{
    Actor, DriverPresence, RideRequest, RideStatus, TripActuals, TripCompletion, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Accept,
    Reject,
    Arrive,
    Start,
    Complete,
    Cancel,
}

/// A committed (or about to be committed) change to one ride.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    /// Status the ride had when the snapshot was taken; stores use it as an
    /// optimistic guard on the write.
    pub expected: RideStatus,
    pub ride: RideRequest,
    /// Driver bound before the transition (cleared by a cancel).
    pub previous_driver: Option<UserId>,
    pub presence: Option<DriverPresence>,
    pub completion: Option<TripCompletion>,
    /// Driver's ETA to pickup, set on accept.
    pub eta_minutes: Option<i32>,
}

impl Transition {
    fn new(kind: TransitionKind, before: &RideRequest, after: RideRequest) -> Self {
        Self {
            kind,
            expected: before.status,
            previous_driver: before.driver_id,
            ride: after,
            presence: None,
            completion: None,
            eta_minutes: None,
        }
    }
}

fn bound_driver(ride: &RideRequest, actor: Actor) -> Result<UserId, DispatchError> {
    match actor {
        Actor::Driver(id) if ride.is_bound_to(id) => Ok(id),
        _ => Err(DispatchError::Unauthorized),
    }
}

fn advanced(ride: &RideRequest, status: RideStatus, now: DateTime<Utc>) -> RideRequest {
    let mut next = ride.clone();
    next.status = status;
    next.updated_at = now;
    next
}

pub fn accept(
    ride: &RideRequest,
    actor: Actor,
    presence: Option<&DriverPresence>,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    let Actor::Driver(driver_id) = actor else {
        return Err(DispatchError::Unauthorized);
    };
    if ride.status != RideStatus::Pending {
        return Err(DispatchError::invalid_state("ride is no longer available"));
    }
    let presence = presence.ok_or_else(|| DispatchError::invalid_state("driver location not found"))?;
    if !presence.is_dispatchable() {
        return Err(DispatchError::invalid_state("driver is not available"));
    }

    let mut next = advanced(ride, RideStatus::Accepted, now);
    next.driver_id = Some(driver_id);

    let mut busy = presence.clone();
    busy.is_available = false;

    let eta = geo::eta_minutes(geo::haversine_km(presence.point(), ride.pickup.point()));

    let mut transition = Transition::new(TransitionKind::Accept, ride, next);
    transition.presence = Some(busy);
    transition.eta_minutes = Some(eta);
    Ok(transition)
}

/// A driver declining a pending ride. No driver was ever bound, so no
/// presence record changes.
pub fn reject(
    ride: &RideRequest,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    if !matches!(actor, Actor::Driver(_)) {
        return Err(DispatchError::Unauthorized);
    }
    if ride.status != RideStatus::Pending {
        return Err(DispatchError::invalid_state("ride is no longer available"));
    }

    let mut next = advanced(ride, RideStatus::Cancelled, now);
    next.cancelled_by = Some(actor.role());
    Ok(Transition::new(TransitionKind::Reject, ride, next))
}

pub fn arrive(
    ride: &RideRequest,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    bound_driver(ride, actor)?;
    if ride.status != RideStatus::Accepted {
        return Err(DispatchError::invalid_state(
            "ride must be accepted before marking arrival",
        ));
    }
    let next = advanced(ride, RideStatus::Arrived, now);
    Ok(Transition::new(TransitionKind::Arrive, ride, next))
}

pub fn start(
    ride: &RideRequest,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    bound_driver(ride, actor)?;
    if !matches!(ride.status, RideStatus::Accepted | RideStatus::Arrived) {
        return Err(DispatchError::invalid_state(
            "ride must be accepted before starting",
        ));
    }
    let next = advanced(ride, RideStatus::Started, now);
    Ok(Transition::new(TransitionKind::Start, ride, next))
}

pub fn complete(
    ride: &RideRequest,
    actor: Actor,
    presence: Option<&DriverPresence>,
    existing: Option<&TripCompletion>,
    actuals: &TripActuals,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    let driver_id = bound_driver(ride, actor)?;
    if existing.is_some() {
        return Err(DispatchError::Conflict("trip already completed".to_string()));
    }
    if ride.status != RideStatus::Started {
        return Err(DispatchError::invalid_state(
            "ride must be started before completion",
        ));
    }

    let completion = TripCompletion {
        ride_id: ride.id,
        driver_id,
        client_id: ride.client_id,
        actual_fare: actuals.actual_fare,
        actual_distance: actuals.actual_distance,
        actual_duration: actuals.actual_duration,
        driver_notes: actuals.driver_notes.clone(),
        client_rating: None,
        client_notes: None,
        driver_rating: None,
        created_at: now,
    };

    let next = advanced(ride, RideStatus::Completed, now);
    let mut transition = Transition::new(TransitionKind::Complete, ride, next);
    transition.presence = released(ride, presence);
    transition.completion = Some(completion);
    Ok(transition)
}

/// Cancels on behalf of the ride's client or its bound driver. The driver
/// reference is cleared so only driver-bearing statuses keep one.
pub fn cancel(
    ride: &RideRequest,
    actor: Actor,
    presence: Option<&DriverPresence>,
    now: DateTime<Utc>,
) -> Result<Transition, DispatchError> {
    let allowed = match actor {
        Actor::Client(id) => ride.client_id == id,
        Actor::Driver(id) => ride.is_bound_to(id),
    };
    if !allowed {
        return Err(DispatchError::Unauthorized);
    }
    if ride.status.is_terminal() {
        return Err(DispatchError::invalid_state("ride cannot be cancelled"));
    }

    let mut next = advanced(ride, RideStatus::Cancelled, now);
    next.driver_id = None;
    next.cancelled_by = Some(actor.role());

    let mut transition = Transition::new(TransitionKind::Cancel, ride, next);
    transition.presence = released(ride, presence);
    Ok(transition)
}

fn released(ride: &RideRequest, presence: Option<&DriverPresence>) -> Option<DriverPresence> {
    presence
        .filter(|p| ride.driver_id == Some(p.driver_id))
        .map(|p| {
            let mut p = p.clone();
            p.release();
            p
        })
}
