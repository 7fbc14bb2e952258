use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppState;
use crate::error::DispatchError;
use crate::models::Actor;
use crate::notifier::Audience;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub user_type: Audience,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct BroadcastReceipt {
    pub delivered: usize,
}

/// Operator announcement over live connections. Any authenticated caller may
/// send one; the gateway restricts who reaches this route.
pub async fn broadcast(
    State(state): State<AppState>,
    _actor: Actor,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastReceipt>, DispatchError> {
    if request.title.trim().is_empty() || request.body.trim().is_empty() {
        return Err(DispatchError::Validation(
            "title and body are required".to_string(),
        ));
    }
    let delivered = state.dispatcher.notifier().broadcast(
        request.user_type,
        &request.title,
        &request.body,
        request.data,
    );
    Ok(Json(BroadcastReceipt { delivered }))
}
