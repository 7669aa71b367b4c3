//! Domain models for the exchange back office.

pub mod balance;
pub mod branch;
pub mod currency;
pub mod document;
pub mod ids;
pub mod notification;
pub mod order;
pub mod rate;
pub mod review;
pub mod user;

pub use balance::CurrencyBalance;
pub use branch::{Branch, DayHours, WEEKDAYS, WorkingHours};
pub use currency::{Currency, CurrencyCode};
pub use document::{DocumentType, OrderDocument};
pub use ids::{BalanceId, BranchId, DocumentId, OrderId, RateId, ReviewId, UserId};
pub use notification::{Notification, NotificationStatus};
pub use order::{Order, OrderItem, OrderStatus, TrackingCode};
pub use rate::ExchangeRate;
pub use review::Review;
pub use user::{Identity, Role, User, generate_referral_code, validate_phone};

/// Loose shape check: one `@`, non-empty local part, dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
        && email.len() <= 254
}
