use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

use super::{queries, ApplyFn, DbPool, DispatchStore, DriverLock};
use crate::dispatch::machine::Transition;
use crate::error::DispatchError;
use crate::models::ride::RideRow;
use crate::models::{
    DriverPresence, GeoPoint, Page, RideId, RideRequest, Role, TripCompletion, TripRating,
    UserId,
};

/// Postgres-backed store. Row locks (`FOR UPDATE`) give the per-ride and
/// per-driver serialization; `lock_timeout` bounds the wait.
pub struct PgStore {
    pool: DbPool,
    lock_wait: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, lock_wait: Duration) -> Self {
        Self { pool, lock_wait }
    }

    /// Creates tables and indexes that do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in queries::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    fn lock_timeout_setting(&self) -> String {
        format!("{}ms", self.lock_wait.as_millis())
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    async fn insert_ride(&self, ride: &RideRequest) -> Result<(), DispatchError> {
        sqlx::query(queries::INSERT_RIDE)
            .bind(ride.id)
            .bind(ride.client_id)
            .bind(ride.driver_id)
            .bind(ride.pickup.lat)
            .bind(ride.pickup.lng)
            .bind(&ride.pickup.address)
            .bind(ride.destination.lat)
            .bind(ride.destination.lng)
            .bind(&ride.destination.address)
            .bind(ride.status.as_str())
            .bind(ride.price)
            .bind(ride.distance)
            .bind(ride.duration)
            .bind(ride.cancelled_by.map(|r| r.as_str()))
            .bind(ride.created_at)
            .bind(ride.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ride(&self, ride_id: RideId) -> Result<Option<RideRequest>, DispatchError> {
        let row: Option<RideRow> = sqlx::query_as(queries::SELECT_RIDE)
            .bind(ride_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RideRequest::try_from).transpose()
    }

    async fn transition(
        &self,
        ride_id: RideId,
        lock: DriverLock,
        apply: ApplyFn,
    ) -> Result<Transition, DispatchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(queries::SET_LOCK_TIMEOUT)
            .bind(self.lock_timeout_setting())
            .execute(&mut *tx)
            .await?;

        // Ride row first, then the driver row.
        let row: Option<RideRow> = sqlx::query_as(queries::SELECT_RIDE_FOR_UPDATE)
            .bind(ride_id)
            .fetch_optional(&mut *tx)
            .await?;
        let ride = RideRequest::try_from(row.ok_or(DispatchError::NotFound("ride"))?)?;

        let presence: Option<DriverPresence> = match lock.resolve(&ride) {
            Some(driver_id) => {
                sqlx::query_as(queries::SELECT_PRESENCE_FOR_UPDATE)
                    .bind(driver_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        let existing: Option<TripCompletion> = sqlx::query_as(queries::SELECT_COMPLETION)
            .bind(ride_id)
            .fetch_optional(&mut *tx)
            .await?;

        // Dropping `tx` on any early return rolls the transaction back.
        let transition = apply(&ride, presence.as_ref(), existing.as_ref())?;

        let next = &transition.ride;
        let updated = sqlx::query(queries::UPDATE_RIDE_GUARDED)
            .bind(ride_id)
            .bind(transition.expected.as_str())
            .bind(next.driver_id)
            .bind(next.status.as_str())
            .bind(next.cancelled_by.map(|r| r.as_str()))
            .bind(next.updated_at)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            warn!(ride_id = %ride_id, "Guarded ride update matched no rows");
            return Err(DispatchError::invalid_state("ride changed concurrently"));
        }

        if let (Some(locked), Some(next)) = (presence.as_ref(), transition.presence.as_ref()) {
            if locked.driver_id == next.driver_id {
                sqlx::query(queries::UPDATE_PRESENCE_AVAILABILITY)
                    .bind(next.driver_id)
                    .bind(next.is_online)
                    .bind(next.is_available)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(completion) = &transition.completion {
            let inserted = sqlx::query(queries::INSERT_COMPLETION)
                .bind(completion.ride_id)
                .bind(completion.driver_id)
                .bind(completion.client_id)
                .bind(completion.actual_fare)
                .bind(completion.actual_distance)
                .bind(completion.actual_duration)
                .bind(&completion.driver_notes)
                .bind(completion.created_at)
                .execute(&mut *tx)
                .await?;
            if inserted.rows_affected() == 0 {
                return Err(DispatchError::Conflict("trip already completed".to_string()));
            }
        }

        tx.commit().await?;
        Ok(transition)
    }

    async fn upsert_location(
        &self,
        driver_id: UserId,
        point: GeoPoint,
        heading: f64,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError> {
        let presence = sqlx::query_as(queries::UPSERT_LOCATION)
            .bind(driver_id)
            .bind(point.lat)
            .bind(point.lng)
            .bind(heading)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(presence)
    }

    async fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
        now: DateTime<Utc>,
    ) -> Result<DriverPresence, DispatchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(queries::SET_LOCK_TIMEOUT)
            .bind(self.lock_timeout_setting())
            .execute(&mut *tx)
            .await?;

        // Same row lock an accept or release takes, so the ride check below
        // sees every transition that committed before it.
        let locked: Option<DriverPresence> = sqlx::query_as(queries::SELECT_PRESENCE_FOR_UPDATE)
            .bind(driver_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(DispatchError::NotFound("driver presence"));
        }

        if available {
            let busy: bool = sqlx::query_scalar(queries::DRIVER_HAS_ACTIVE_RIDE)
                .bind(driver_id)
                .fetch_one(&mut *tx)
                .await?;
            if busy {
                return Err(DispatchError::invalid_state("driver has an active ride"));
            }
        }

        let presence: DriverPresence = sqlx::query_as(queries::SET_AVAILABILITY)
            .bind(driver_id)
            .bind(available)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(presence)
    }

    async fn mark_offline(
        &self,
        driver_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DriverPresence>, DispatchError> {
        let presence = sqlx::query_as(queries::MARK_OFFLINE)
            .bind(driver_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(presence)
    }

    async fn presence(&self, driver_id: UserId) -> Result<Option<DriverPresence>, DispatchError> {
        let presence = sqlx::query_as(queries::SELECT_PRESENCE)
            .bind(driver_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(presence)
    }

    async fn available_presences(&self) -> Result<Vec<DriverPresence>, DispatchError> {
        let presences = sqlx::query_as(queries::SELECT_AVAILABLE_PRESENCES)
            .fetch_all(&self.pool)
            .await?;
        Ok(presences)
    }

    async fn active_rides_for_driver(
        &self,
        driver_id: UserId,
    ) -> Result<Vec<RideRequest>, DispatchError> {
        let rows: Vec<RideRow> = sqlx::query_as(queries::SELECT_ACTIVE_RIDES_FOR_DRIVER)
            .bind(driver_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RideRequest::try_from).collect()
    }

    async fn completion(&self, ride_id: RideId) -> Result<Option<TripCompletion>, DispatchError> {
        let completion = sqlx::query_as(queries::SELECT_COMPLETION)
            .bind(ride_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(completion)
    }

    async fn rate_trip(
        &self,
        ride_id: RideId,
        rater: Role,
        rating: &TripRating,
    ) -> Result<TripCompletion, DispatchError> {
        let query = match rater {
            Role::Client => queries::RATE_AS_CLIENT,
            Role::Driver => queries::RATE_AS_DRIVER,
        };
        let completion: Option<TripCompletion> = sqlx::query_as(query)
            .bind(ride_id)
            .bind(rating.rating)
            .bind(&rating.notes)
            .fetch_optional(&self.pool)
            .await?;
        completion.ok_or(DispatchError::NotFound("trip completion"))
    }

    async fn completions_for(
        &self,
        role: Role,
        user_id: UserId,
        page: Page,
    ) -> Result<(Vec<TripCompletion>, i64), DispatchError> {
        let (select, count) = match role {
            Role::Driver => (
                queries::SELECT_DRIVER_COMPLETIONS,
                queries::COUNT_DRIVER_COMPLETIONS,
            ),
            Role::Client => (
                queries::SELECT_CLIENT_COMPLETIONS,
                queries::COUNT_CLIENT_COMPLETIONS,
            ),
        };
        let completions = sqlx::query_as(select)
            .bind(user_id)
            .bind(page.offset())
            .bind(i64::from(page.limit))
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar(count)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((completions, total))
    }
}
