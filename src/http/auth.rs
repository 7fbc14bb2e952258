use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::{Actor, Role};

/// Set by the gateway after it has verified the caller's token.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());

        let id = header(USER_ID_HEADER)
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or(DispatchError::Unauthenticated)?;
        let role = header(USER_ROLE_HEADER)
            .and_then(|s| s.parse::<Role>().ok())
            .ok_or(DispatchError::Unauthenticated)?;

        Ok(Actor::new(id, role))
    }
}
