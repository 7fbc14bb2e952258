use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::dispatch::machine::Transition;
use crate::error::DispatchError;
use crate::models::{
    DriverPresence, GeoPoint, Page, RideId, RideRequest, Role, TripCompletion, TripRating,
    UserId,
};

pub mod memory;
pub mod postgres;
pub mod queries;

pub type DbPool = Pool<Postgres>;

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Which driver presence record a transition must lock alongside the ride.
///
/// Locks are always taken ride first, then driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverLock {
    None,
    /// The calling driver (accept).
    Actor(UserId),
    /// Whoever is bound to the ride when the lock is taken (complete, cancel).
    Bound,
}

impl DriverLock {
    pub fn resolve(&self, ride: &RideRequest) -> Option<UserId> {
        match self {
            Self::None => None,
            Self::Actor(id) => Some(*id),
            Self::Bound => ride.driver_id,
        }
    }
}

/// Pure guard-and-compute step run against the locked snapshot.
pub type ApplyFn = Box<
    dyn FnOnce(
            &RideRequest,
            Option<&DriverPresence>,
            Option<&TripCompletion>,
        ) -> Result<Transition, DispatchError>
        + Send,
>;

pub fn apply_with<F>(apply: F) -> ApplyFn
where
    F: FnOnce(
            &RideRequest,
            Option<&DriverPresence>,
            Option<&TripCompletion>,
        ) -> Result<Transition, DispatchError>
        + Send
        + 'static,
{
    Box::new(apply)
}

/// Ride and driver-presence persistence with per-key serialization.
///
/// Every mutating method either lands completely or leaves the records as
/// they were; lock waits past the configured bound fail with
/// [`DispatchError::Busy`].
#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn insert_ride(&self, ride: &RideRequest) -> Result<(), DispatchError>;

    async fn ride(&self, ride_id: RideId) -> Result<Option<RideRequest>, DispatchError>;

    /// Locks the ride (and the driver named by `lock`), runs `apply` on the
    /// snapshot and writes the ride, presence and completion it returns as
    /// one unit.
    async fn transition(
        &self,
        ride_id: RideId,
        lock: DriverLock,
        apply: ApplyFn,
    ) -> Result<Transition, DispatchError>;

    async fn upsert_location(
        &self,
        driver_id: UserId,
        point: GeoPoint,
        heading: f64,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError>;

    /// Fails with InvalidState when asked to make available a driver who
    /// is still bound to an accepted, arrived or started ride.
    async fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError>;

    async fn mark_offline(
        &self,
        driver_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DriverPresence>, DispatchError>;

    async fn presence(&self, driver_id: UserId) -> Result<Option<DriverPresence>, DispatchError>;

    /// Presences with `online && available`.
    async fn available_presences(&self) -> Result<Vec<DriverPresence>, DispatchError>;

    /// Accepted, arrived or started rides bound to the driver.
    async fn active_rides_for_driver(
        &self,
        driver_id: UserId,
    ) -> Result<Vec<RideRequest>, DispatchError>;

    async fn completion(&self, ride_id: RideId) -> Result<Option<TripCompletion>, DispatchError>;

    async fn rate_trip(
        &self,
        ride_id: RideId,
        rater: Role,
        rating: &TripRating,
    ) -> Result<TripCompletion, DispatchError>;

    /// One page of the completions where `user_id` was the `role` party,
    /// newest first, with the total count.
    async fn completions_for(
        &self,
        role: Role,
        user_id: UserId,
        page: Page,
    ) -> Result<(Vec<TripCompletion>, i64), DispatchError>;
}

const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Runs an idempotent read up to `attempts` times while it fails with a
/// retryable error.
pub async fn retry_read<T, F, Fut>(attempts: u32, mut read: F) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match read().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!("Store read failed ({} / {}): {}", attempt, attempts, e);
                tokio::time::sleep(READ_RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
