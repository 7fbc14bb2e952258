use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::error::DispatchError;
use crate::models::{Actor, Page, Role, TripHistory};

/// Raw `page` / `limit`; bad values fall back to defaults instead of failing.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl HistoryQuery {
    fn page(&self) -> Page {
        Page::from_query(self.page.as_deref(), self.limit.as_deref())
    }
}

/// GET /drivers/trips
pub async fn driver_history(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<TripHistory>, DispatchError> {
    let history = state
        .dispatcher
        .trip_history(actor, Role::Driver, query.page())
        .await?;
    Ok(Json(history))
}

/// GET /clients/trips
pub async fn client_history(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<TripHistory>, DispatchError> {
    let history = state
        .dispatcher
        .trip_history(actor, Role::Client, query.page())
        .await?;
    Ok(Json(history))
}
