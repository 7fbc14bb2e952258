use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::DispatchError;
use crate::models::{Actor, DriverPresence, DriverStatus, GeoPoint, RideRequest};
use crate::presence::NearbyDriver;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: f64,
}

impl LocationUpdate {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityUpdate {
    pub is_available: bool,
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub status: DriverStatus,
    #[serde(flatten)]
    pub presence: DriverPresence,
}

pub async fn assigned_rides(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<RideRequest>>, DispatchError> {
    Ok(Json(state.dispatcher.assigned_rides(actor).await?))
}

pub async fn update_location(
    State(state): State<AppState>,
    actor: Actor,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<DriverPresence>, DispatchError> {
    let presence = state
        .dispatcher
        .update_location(actor, update.point(), update.heading)
        .await?;
    Ok(Json(presence))
}

pub async fn set_availability(
    State(state): State<AppState>,
    actor: Actor,
    Json(update): Json<AvailabilityUpdate>,
) -> Result<Json<DriverPresence>, DispatchError> {
    let presence = state
        .dispatcher
        .set_availability(actor, update.is_available)
        .await?;
    Ok(Json(presence))
}

pub async fn status(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<StatusView>, DispatchError> {
    let presence = state.dispatcher.driver_status(actor).await?;
    Ok(Json(StatusView {
        status: presence.status(),
        presence,
    }))
}

pub async fn nearby(
    State(state): State<AppState>,
    _actor: Actor,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, DispatchError> {
    let point = GeoPoint {
        lat: query.lat,
        lng: query.lng,
    };
    Ok(Json(
        state.dispatcher.nearby_drivers(point, query.radius).await?,
    ))
}
