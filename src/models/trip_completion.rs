use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{RideId, Role, UserId};
use crate::error::DispatchError;

/// Actuals of a finished ride. Only the rating fields change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TripCompletion {
    pub ride_id: RideId,
    pub driver_id: UserId,
    pub client_id: UserId,
    pub actual_fare: f64,
    pub actual_distance: f64,
    pub actual_duration: i32, // minutes
    pub driver_notes: Option<String>,
    pub client_rating: Option<f64>,
    pub client_notes: Option<String>,
    pub driver_rating: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl TripCompletion {
    /// Records one party's rating. A driver rating without notes keeps the
    /// notes written at completion.
    pub fn rate(&mut self, rater: Role, rating: &TripRating) {
        match rater {
            Role::Client => {
                self.client_rating = Some(rating.rating);
                self.client_notes = rating.notes.clone();
            }
            Role::Driver => {
                self.driver_rating = Some(rating.rating);
                if rating.notes.is_some() {
                    self.driver_notes = rating.notes.clone();
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripActuals {
    pub actual_fare: f64,
    pub actual_distance: f64,
    pub actual_duration: i32,
    #[serde(default)]
    pub driver_notes: Option<String>,
}

impl TripActuals {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.actual_fare.is_nan() || self.actual_fare < 0.0 {
            return Err(DispatchError::Validation(
                "actual fare must be non-negative".to_string(),
            ));
        }
        if self.actual_distance.is_nan() || self.actual_distance < 0.0 {
            return Err(DispatchError::Validation(
                "actual distance must be non-negative".to_string(),
            ));
        }
        if self.actual_duration < 0 {
            return Err(DispatchError::Validation(
                "actual duration must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// One page of a trip history listing, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Unparsable or out-of-range values fall back to the first page of
    /// [`DEFAULT_PAGE_SIZE`].
    pub fn from_query(page: Option<&str>, limit: Option<&str>) -> Self {
        let page = page
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let limit = limit
            .and_then(|l| l.trim().parse::<u32>().ok())
            .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page, limit }
    }

    pub fn offset(&self) -> i64 {
        (i64::from(self.page) - 1) * i64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

/// Completed trips of one party, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripHistory {
    pub completions: Vec<TripCompletion>,
    pub pagination: Pagination,
}

impl TripHistory {
    pub fn new(completions: Vec<TripCompletion>, page: Page, total: i64) -> Self {
        let limit = i64::from(page.limit);
        Self {
            completions,
            pagination: Pagination {
                page: page.page,
                limit: page.limit,
                total,
                total_pages: (total + limit - 1) / limit,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripRating {
    pub rating: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TripRating {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(1.0..=5.0).contains(&self.rating) {
            return Err(DispatchError::Validation(
                "rating must be between 1 and 5".to_string(),
            ));
        }
        Ok(())
    }
}
