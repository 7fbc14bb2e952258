pub mod auth;
mod drivers;
mod notifications;
mod rides;
mod trips;
mod ws;

use axum::routing::{get, patch, post};
use axum::Router;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::hub::Hub;

/// Explicitly constructed components shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub hub: Hub,
    pub ping_interval: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rides/request", post(rides::request_ride))
        .route("/rides/:id", get(rides::get_ride))
        .route("/rides/:id/accept", post(rides::accept))
        .route("/rides/:id/reject", post(rides::reject))
        .route("/rides/:id/arrived", post(rides::arrived))
        .route("/rides/:id/start", post(rides::start))
        .route("/rides/:id/complete", post(rides::complete))
        .route("/rides/:id/cancel", post(rides::cancel))
        .route("/rides/:id/status", patch(rides::update_status))
        .route("/rides/:id/completion", get(rides::completion))
        .route("/rides/:id/rate", post(rides::rate))
        .route("/drivers/rides", get(drivers::assigned_rides))
        .route("/drivers/location", post(drivers::update_location))
        .route("/drivers/availability", post(drivers::set_availability))
        .route("/drivers/status", get(drivers::status))
        .route("/drivers/nearby", get(drivers::nearby))
        .route("/drivers/trips", get(trips::driver_history))
        .route("/clients/trips", get(trips::client_history))
        .route("/notifications/broadcast", post(notifications::broadcast))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
