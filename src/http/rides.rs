use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::dispatch::machine::Transition;
use crate::dispatch::{NewRide, RideDispatch};
use crate::error::DispatchError;
use crate::models::{Actor, RideId, RideRequest, RideStatus, TripActuals, TripCompletion, TripRating};

/// Ride as it stands after a transition, plus what the transition produced.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    #[serde(flatten)]
    pub ride: RideRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<TripCompletion>,
}

impl From<Transition> for TransitionResponse {
    fn from(transition: Transition) -> Self {
        Self {
            ride: transition.ride,
            eta_minutes: transition.eta_minutes,
            completion: transition.completion,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: RideStatus,
}

type TransitionResult = Result<Json<TransitionResponse>, DispatchError>;

pub async fn request_ride(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<NewRide>,
) -> Result<(StatusCode, Json<RideDispatch>), DispatchError> {
    let created = state.dispatcher.request_ride(actor, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_ride(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> Result<Json<RideRequest>, DispatchError> {
    Ok(Json(state.dispatcher.ride(actor, ride_id).await?))
}

pub async fn accept(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> TransitionResult {
    Ok(Json(state.dispatcher.accept(actor, ride_id).await?.into()))
}

pub async fn reject(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> TransitionResult {
    Ok(Json(state.dispatcher.reject(actor, ride_id).await?.into()))
}

pub async fn arrived(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> TransitionResult {
    Ok(Json(state.dispatcher.arrive(actor, ride_id).await?.into()))
}

pub async fn start(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> TransitionResult {
    Ok(Json(state.dispatcher.start(actor, ride_id).await?.into()))
}

pub async fn complete(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
    Json(actuals): Json<TripActuals>,
) -> TransitionResult {
    Ok(Json(
        state
            .dispatcher
            .complete(actor, ride_id, actuals)
            .await?
            .into(),
    ))
}

pub async fn cancel(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> TransitionResult {
    Ok(Json(state.dispatcher.cancel(actor, ride_id).await?.into()))
}

pub async fn update_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
    Json(update): Json<StatusUpdate>,
) -> TransitionResult {
    Ok(Json(
        state
            .dispatcher
            .update_status(actor, ride_id, update.status)
            .await?
            .into(),
    ))
}

pub async fn completion(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
) -> Result<Json<TripCompletion>, DispatchError> {
    Ok(Json(state.dispatcher.completion(actor, ride_id).await?))
}

pub async fn rate(
    State(state): State<AppState>,
    actor: Actor,
    Path(ride_id): Path<RideId>,
    Json(rating): Json<TripRating>,
) -> Result<Json<TripCompletion>, DispatchError> {
    Ok(Json(state.dispatcher.rate(actor, ride_id, rating).await?))
}
