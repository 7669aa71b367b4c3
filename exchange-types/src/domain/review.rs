//! Client reviews of completed orders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ids::{OrderId, ReviewId, UserId};
use super::order::{Order, OrderStatus};
use crate::error::DomainError;

/// A rating left by the client of a completed order. One per order.
///
/// New reviews start hidden until staff publish them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Review {
    pub id: ReviewId,
    pub order_id: OrderId,
    pub user_id: UserId,
    /// 1 to 5 stars
    #[schema(example = 5, minimum = 1, maximum = 5)]
    pub rating: u8,
    #[schema(example = "Fast and friendly service")]
    pub text: String,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
}

impl Review {
    pub const MIN_RATING: u8 = 1;
    pub const MAX_RATING: u8 = 5;

    /// Creates a hidden review for `order`.
    ///
    /// # Validation
    /// - The order is completed
    /// - Rating is within 1..=5
    /// - Text is not blank
    pub fn new(order: &Order, user_id: UserId, rating: u8, text: String) -> Result<Self, DomainError> {
        if order.status != OrderStatus::Completed {
            return Err(DomainError::Validation(
                "Only completed orders can be reviewed".into(),
            ));
        }
        if !(Self::MIN_RATING..=Self::MAX_RATING).contains(&rating) {
            return Err(DomainError::Validation(format!(
                "Rating must be between {} and {}",
                Self::MIN_RATING,
                Self::MAX_RATING
            )));
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(DomainError::Validation("Review text cannot be empty".into()));
        }

        Ok(Self {
            id: ReviewId::new(),
            order_id: order.id,
            user_id,
            rating,
            text,
            is_visible: false,
            created_at: Utc::now(),
        })
    }
}
