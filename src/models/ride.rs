use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{RideId, Role, UserId};
use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Pending,
    Accepted,
    Arrived,
    Started,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Arrived => "arrived",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses in which the ride carries a driver reference.
    pub fn has_driver(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Arrived | Self::Started | Self::Completed
        )
    }

    /// Non-terminal statuses with a bound driver.
    pub fn is_active(&self) -> bool {
        self.has_driver() && !self.is_terminal()
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "arrived" => Ok(Self::Arrived),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DispatchError::Validation(format!(
                "unknown ride status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(DispatchError::Validation("invalid latitude".to_string()));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(DispatchError::Validation("invalid longitude".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: String,
}

impl Place {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub id: RideId,
    pub client_id: UserId,
    pub driver_id: Option<UserId>,
    pub pickup: Place,
    pub destination: Place,
    pub status: RideStatus,
    pub price: f64,
    /// Kilometres.
    pub distance: f64,
    /// Minutes.
    pub duration: i32,
    pub cancelled_by: Option<Role>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RideRequest {
    pub fn is_bound_to(&self, driver_id: UserId) -> bool {
        self.driver_id == Some(driver_id)
    }
}

#[derive(Debug, FromRow)]
pub struct RideRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub pickup_addr: String,
    pub dest_lat: f64,
    pub dest_lng: f64,
    pub dest_addr: String,
    pub status: String, // TEXT in DDL
    pub price: f64,
    pub distance: f64,
    pub duration: i32,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RideRow> for RideRequest {
    type Error = DispatchError;

    fn try_from(row: RideRow) -> Result<Self, Self::Error> {
        let cancelled_by = row
            .cancelled_by
            .as_deref()
            .map(str::parse::<Role>)
            .transpose()
            .map_err(DispatchError::Store)?;

        Ok(Self {
            id: row.id,
            client_id: row.client_id,
            driver_id: row.driver_id,
            pickup: Place {
                lat: row.pickup_lat,
                lng: row.pickup_lng,
                address: row.pickup_addr,
            },
            destination: Place {
                lat: row.dest_lat,
                lng: row.dest_lng,
                address: row.dest_addr,
            },
            status: row.status.parse()?,
            price: row.price,
            distance: row.distance,
            duration: row.duration,
            cancelled_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
