//! Outbox notifications written alongside order changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::{Order, OrderStatus};

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_STATUS_CHANGED: &str = "order.status_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NotificationStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AsRef<str> for NotificationStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("Unknown notification status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    /// Earliest time a worker may claim the row. Doubles as the lease
    /// expiry while the row is `Processing`.
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl Notification {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            status: NotificationStatus::Pending,
            created_at: now,
            available_at: now,
            processed_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn order_created(order: &Order) -> Self {
        Self::new(
            ORDER_CREATED,
            serde_json::json!({
                "order_id": order.id,
                "tracking_code": order.tracking_code,
                "client_email": order.client_email,
                "branch_id": order.branch_id,
                "status": order.status,
            }),
        )
    }

    pub fn status_changed(order: &Order, previous: OrderStatus) -> Self {
        Self::new(
            ORDER_STATUS_CHANGED,
            serde_json::json!({
                "order_id": order.id,
                "tracking_code": order.tracking_code,
                "client_email": order.client_email,
                "previous_status": previous,
                "status": order.status,
                "operator_id": order.operator_id,
            }),
        )
    }
}
