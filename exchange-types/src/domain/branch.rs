//! Branch (exchange office) domain model.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::currency::CurrencyCode;
use super::ids::{BranchId, UserId};
use crate::error::DomainError;

pub const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Opening and closing time for one day, `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DayHours {
    #[schema(example = "09:00")]
    pub open: String,
    #[schema(example = "18:00")]
    pub close: String,
}

/// Weekly schedule keyed by lowercase weekday name.
///
/// Either empty (schedule not published) or covering all seven days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct WorkingHours(pub BTreeMap<String, DayHours>);

impl WorkingHours {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.0.is_empty() {
            return Ok(());
        }
        for day in self.0.keys() {
            if !WEEKDAYS.contains(&day.as_str()) {
                return Err(DomainError::Validation(format!("Unknown weekday: {}", day)));
            }
        }
        for day in WEEKDAYS {
            let hours = self.0.get(day).ok_or_else(|| {
                DomainError::Validation(format!("Working hours missing for {}", day))
            })?;
            let open = parse_time(day, &hours.open)?;
            let close = parse_time(day, &hours.close)?;
            if open >= close {
                return Err(DomainError::Validation(format!(
                    "Opening time must be before closing time on {}",
                    day
                )));
            }
        }
        Ok(())
    }
}

fn parse_time(day: &str, value: &str) -> Result<NaiveTime, DomainError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
        DomainError::Validation(format!("Invalid time '{}' for {}, expected HH:MM", value, day))
    })
}

/// A physical exchange office.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Branch {
    pub id: BranchId,
    #[schema(example = "Central")]
    pub name: String,
    #[schema(example = "Kyiv")]
    pub city: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub is_active: bool,
    /// Currency the branch keeps its books in
    pub base_currency: CurrencyCode,
    pub manager_id: Option<UserId>,
    pub working_hours: WorkingHours,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    /// Checks the fields a caller controls.
    pub fn validate(&self) -> Result<(), DomainError> {
        for (field, value) in [
            ("name", &self.name),
            ("city", &self.city),
            ("address", &self.address),
            ("phone", &self.phone),
        ] {
            if value.trim().is_empty() {
                return Err(DomainError::Validation(format!(
                    "Branch {} cannot be empty",
                    field
                )));
            }
        }
        if !super::is_valid_email(&self.email) {
            return Err(DomainError::Validation(format!(
                "Invalid branch email: {}",
                self.email
            )));
        }
        self.working_hours.validate()
    }
}
