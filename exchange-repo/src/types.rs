//! Database row structs and conversions for SQLite and PostgreSQL.
//!
//! Postgres rows use native column types. SQLite stores UUIDs, decimals and
//! timestamps as TEXT, so its rows carry strings that are parsed on the way
//! out. Both sets can be compiled side by side.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use exchange_types::{Currency, CurrencyCode, DomainError, RepoError};

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn db_err(e: sqlx::Error) -> RepoError {
    RepoError::Database(e.to_string())
}

pub(crate) fn tx_err(e: sqlx::Error) -> RepoError {
    RepoError::Transaction(e.to_string())
}

/// Maps constraint violations on writes to domain errors.
///
/// `on_unique` names the rule a unique violation breaks.
pub(crate) fn write_err(e: sqlx::Error, on_unique: &str) -> RepoError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return RepoError::Domain(DomainError::Validation(on_unique.to_string()));
        }
        if db.is_foreign_key_violation() {
            return RepoError::Domain(DomainError::Validation(
                "Referenced record does not exist".into(),
            ));
        }
        if db.is_check_violation() {
            return RepoError::Domain(DomainError::Validation(db.message().to_string()));
        }
    }
    db_err(e)
}

/// Maps a unique violation to a conflict, for writes that race with each other.
pub(crate) fn race_err(e: sqlx::Error, what: &str) -> RepoError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepoError::Conflict(what.to_string()),
        _ => db_err(e),
    }
}

fn corrupt(what: &str, value: &str) -> RepoError {
    RepoError::Database(format!("Invalid {} in database: {}", what, value))
}

pub(crate) fn parse_code(s: &str) -> Result<CurrencyCode, RepoError> {
    CurrencyCode::parse(s).map_err(|_| corrupt("currency code", s))
}

pub(crate) fn parse_enum<T: FromStr>(what: &str, s: &str) -> Result<T, RepoError> {
    s.parse().map_err(|_| corrupt(what, s))
}

#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepoError> {
    Uuid::parse_str(s).map_err(|_| corrupt("uuid", s))
}

#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn parse_decimal(s: &str) -> Result<Decimal, RepoError> {
    Decimal::from_str(s).map_err(|_| corrupt("decimal", s))
}

#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", s))
}

/// Fixed-width RFC 3339 so TEXT columns sort chronologically.
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Column lists
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) const CURRENCY_COLUMNS: &str = "code, name, symbol, decimal_places, is_active";
pub(crate) const BRANCH_COLUMNS: &str = "id, name, city, address, phone, email, is_active, base_currency, manager_id, working_hours, created_at, updated_at";
pub(crate) const RATE_COLUMNS: &str =
    "id, branch_id, from_currency, to_currency, rate, min_amount, is_active, updated_at";
pub(crate) const BALANCE_COLUMNS: &str =
    "id, branch_id, currency, amount, average_purchase_rate, version, updated_at";
pub(crate) const ORDER_COLUMNS: &str = "id, tracking_code, user_id, branch_id, status, client_email, client_phone, delivery_address, operator_id, created_at, updated_at";
pub(crate) const ITEM_COLUMNS: &str =
    "i.order_id, i.position, i.from_currency, i.to_currency, i.from_amount, i.to_amount, i.rate";
pub(crate) const DOCUMENT_COLUMNS: &str =
    "d.id, d.order_id, d.doc_type, d.file_handle, d.uploaded_by, d.uploaded_at";
pub(crate) const REVIEW_COLUMNS: &str =
    "id, order_id, user_id, rating, text, is_visible, created_at";
pub(crate) const USER_COLUMNS: &str = "id, external_id, email, username, first_name, last_name, phone, telegram, referral_code, referred_by, referral_balance, created_at";
pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, event_type, payload, status, created_at, available_at, processed_at, attempts, last_error";

// ─────────────────────────────────────────────────────────────────────────────
// Shared rows
// ─────────────────────────────────────────────────────────────────────────────

/// Currency row; identical column types on both backends.
#[derive(FromRow)]
pub struct DbCurrency {
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub decimal_places: i32,
    pub is_active: bool,
}

impl DbCurrency {
    pub fn into_domain(self) -> Result<Currency, RepoError> {
        Ok(Currency {
            code: parse_code(&self.code)?,
            name: self.name,
            symbol: self.symbol,
            decimal_places: u32::try_from(self.decimal_places)
                .map_err(|_| corrupt("decimal places", &self.decimal_places.to_string()))?,
            is_active: self.is_active,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL rows
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "postgres")]
pub mod pg {
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use sqlx::FromRow;
    use uuid::Uuid;

    use exchange_types::domain::{BalanceId, DocumentId, WorkingHours};
    use exchange_types::{
        Branch, BranchId, CurrencyBalance, ExchangeRate, Notification, Order,
        OrderDocument, OrderId, OrderItem, RateId, RepoError, Review, ReviewId, TrackingCode, User,
        UserId,
    };

    use super::{corrupt, parse_code, parse_enum};

    #[derive(FromRow)]
    pub struct DbBranch {
        pub id: Uuid,
        pub name: String,
        pub city: String,
        pub address: String,
        pub phone: String,
        pub email: String,
        pub is_active: bool,
        pub base_currency: String,
        pub manager_id: Option<Uuid>,
        pub working_hours: serde_json::Value,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl DbBranch {
        pub fn into_domain(self) -> Result<Branch, RepoError> {
            let working_hours: WorkingHours = serde_json::from_value(self.working_hours)
                .map_err(|e| corrupt("working hours", &e.to_string()))?;
            Ok(Branch {
                id: BranchId::from_uuid(self.id),
                name: self.name,
                city: self.city,
                address: self.address,
                phone: self.phone,
                email: self.email,
                is_active: self.is_active,
                base_currency: parse_code(&self.base_currency)?,
                manager_id: self.manager_id.map(UserId::from_uuid),
                working_hours,
                created_at: self.created_at,
                updated_at: self.updated_at,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbRate {
        pub id: Uuid,
        pub branch_id: Uuid,
        pub from_currency: String,
        pub to_currency: String,
        pub rate: Decimal,
        pub min_amount: Decimal,
        pub is_active: bool,
        pub updated_at: DateTime<Utc>,
    }

    impl DbRate {
        pub fn into_domain(self) -> Result<ExchangeRate, RepoError> {
            Ok(ExchangeRate {
                id: RateId::from_uuid(self.id),
                branch_id: BranchId::from_uuid(self.branch_id),
                from_currency: parse_code(&self.from_currency)?,
                to_currency: parse_code(&self.to_currency)?,
                rate: self.rate,
                min_amount: self.min_amount,
                is_active: self.is_active,
                updated_at: self.updated_at,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbBalance {
        pub id: Uuid,
        pub branch_id: Uuid,
        pub currency: String,
        pub amount: Decimal,
        pub average_purchase_rate: Decimal,
        pub updated_at: DateTime<Utc>,
    }

    impl DbBalance {
        pub fn into_domain(self) -> Result<CurrencyBalance, RepoError> {
            Ok(CurrencyBalance {
                id: BalanceId::from_uuid(self.id),
                branch_id: BranchId::from_uuid(self.branch_id),
                currency: parse_code(&self.currency)?,
                amount: self.amount,
                average_purchase_rate: self.average_purchase_rate,
                updated_at: self.updated_at,
            })
        }
    }

    /// Order header; items and documents are loaded separately.
    #[derive(FromRow)]
    pub struct DbOrder {
        pub id: Uuid,
        pub tracking_code: String,
        pub user_id: Option<Uuid>,
        pub branch_id: Uuid,
        pub status: String,
        pub client_email: String,
        pub client_phone: Option<String>,
        pub delivery_address: Option<String>,
        pub operator_id: Option<Uuid>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl DbOrder {
        pub fn into_domain(
            self,
            items: Vec<OrderItem>,
            documents: Vec<OrderDocument>,
        ) -> Result<Order, RepoError> {
            Ok(Order {
                id: OrderId::from_uuid(self.id),
                tracking_code: TrackingCode::parse(&self.tracking_code)
                    .map_err(|_| corrupt("tracking code", &self.tracking_code))?,
                user_id: self.user_id.map(UserId::from_uuid),
                branch_id: BranchId::from_uuid(self.branch_id),
                status: parse_enum("order status", &self.status)?,
                client_email: self.client_email,
                client_phone: self.client_phone,
                delivery_address: self.delivery_address,
                operator_id: self.operator_id.map(UserId::from_uuid),
                items,
                documents,
                created_at: self.created_at,
                updated_at: self.updated_at,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbOrderItem {
        pub order_id: Uuid,
        pub position: i32,
        pub from_currency: String,
        pub to_currency: String,
        pub from_amount: Decimal,
        pub to_amount: Decimal,
        pub rate: Decimal,
    }

    impl DbOrderItem {
        pub fn into_domain(self) -> Result<OrderItem, RepoError> {
            Ok(OrderItem {
                position: u32::try_from(self.position)
                    .map_err(|_| corrupt("item position", &self.position.to_string()))?,
                from_currency: parse_code(&self.from_currency)?,
                to_currency: parse_code(&self.to_currency)?,
                from_amount: self.from_amount,
                to_amount: self.to_amount,
                rate: self.rate,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbDocument {
        pub id: Uuid,
        pub order_id: Uuid,
        pub doc_type: String,
        pub file_handle: String,
        pub uploaded_by: Option<Uuid>,
        pub uploaded_at: DateTime<Utc>,
    }

    impl DbDocument {
        pub fn into_domain(self) -> Result<OrderDocument, RepoError> {
            Ok(OrderDocument {
                id: DocumentId::from_uuid(self.id),
                order_id: OrderId::from_uuid(self.order_id),
                doc_type: parse_enum("document type", &self.doc_type)?,
                file_handle: self.file_handle,
                uploaded_by: self.uploaded_by.map(UserId::from_uuid),
                uploaded_at: self.uploaded_at,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbReview {
        pub id: Uuid,
        pub order_id: Uuid,
        pub user_id: Uuid,
        pub rating: i16,
        pub text: String,
        pub is_visible: bool,
        pub created_at: DateTime<Utc>,
    }

    impl DbReview {
        pub fn into_domain(self) -> Result<Review, RepoError> {
            Ok(Review {
                id: ReviewId::from_uuid(self.id),
                order_id: OrderId::from_uuid(self.order_id),
                user_id: UserId::from_uuid(self.user_id),
                rating: u8::try_from(self.rating)
                    .map_err(|_| corrupt("rating", &self.rating.to_string()))?,
                text: self.text,
                is_visible: self.is_visible,
                created_at: self.created_at,
            })
        }
    }

    /// User row; roles live in `user_roles`.
    #[derive(FromRow)]
    pub struct DbUser {
        pub id: Uuid,
        pub external_id: String,
        pub email: String,
        pub username: String,
        pub first_name: Option<String>,
        pub last_name: Option<String>,
        pub phone: Option<String>,
        pub telegram: Option<String>,
        pub referral_code: String,
        pub referred_by: Option<Uuid>,
        pub referral_balance: Decimal,
        pub created_at: DateTime<Utc>,
    }

    impl DbUser {
        pub fn into_domain(self, roles: Vec<String>) -> Result<User, RepoError> {
            Ok(User {
                id: UserId::from_uuid(self.id),
                external_id: self.external_id,
                email: self.email,
                username: self.username,
                first_name: self.first_name,
                last_name: self.last_name,
                phone: self.phone,
                telegram: self.telegram,
                referral_code: self.referral_code,
                referred_by: self.referred_by.map(UserId::from_uuid),
                referral_balance: self.referral_balance,
                roles: roles
                    .iter()
                    .map(|r| parse_enum("role", r))
                    .collect::<Result<_, _>>()?,
                created_at: self.created_at,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbNotification {
        pub id: Uuid,
        pub event_type: String,
        pub payload: serde_json::Value,
        pub status: String,
        pub created_at: DateTime<Utc>,
        pub available_at: DateTime<Utc>,
        pub processed_at: Option<DateTime<Utc>>,
        pub attempts: i32,
        pub last_error: Option<String>,
    }

    impl DbNotification {
        pub fn into_domain(self) -> Result<Notification, RepoError> {
            Ok(Notification {
                id: self.id,
                event_type: self.event_type,
                payload: self.payload,
                status: parse_enum("notification status", &self.status)?,
                created_at: self.created_at,
                available_at: self.available_at,
                processed_at: self.processed_at,
                attempts: self.attempts,
                last_error: self.last_error,
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite rows
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
pub mod lite {
    use sqlx::FromRow;

    use exchange_types::domain::{BalanceId, DocumentId, WorkingHours};
    use exchange_types::{
        Branch, BranchId, CurrencyBalance, ExchangeRate, Notification, Order, OrderDocument,
        OrderId, OrderItem, RateId, RepoError, Review, ReviewId, TrackingCode, User, UserId,
    };

    use super::{corrupt, parse_code, parse_decimal, parse_enum, parse_time, parse_uuid};

    fn parse_opt_uuid(s: Option<&str>) -> Result<Option<uuid::Uuid>, RepoError> {
        s.map(parse_uuid).transpose()
    }

    #[derive(FromRow)]
    pub struct DbBranch {
        pub id: String,
        pub name: String,
        pub city: String,
        pub address: String,
        pub phone: String,
        pub email: String,
        pub is_active: bool,
        pub base_currency: String,
        pub manager_id: Option<String>,
        pub working_hours: String,
        pub created_at: String,
        pub updated_at: String,
    }

    impl DbBranch {
        pub fn into_domain(self) -> Result<Branch, RepoError> {
            let working_hours: WorkingHours = serde_json::from_str(&self.working_hours)
                .map_err(|_| corrupt("working hours", &self.working_hours))?;
            Ok(Branch {
                id: BranchId::from_uuid(parse_uuid(&self.id)?),
                name: self.name,
                city: self.city,
                address: self.address,
                phone: self.phone,
                email: self.email,
                is_active: self.is_active,
                base_currency: parse_code(&self.base_currency)?,
                manager_id: parse_opt_uuid(self.manager_id.as_deref())?.map(UserId::from_uuid),
                working_hours,
                created_at: parse_time(&self.created_at)?,
                updated_at: parse_time(&self.updated_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbRate {
        pub id: String,
        pub branch_id: String,
        pub from_currency: String,
        pub to_currency: String,
        pub rate: String,
        pub min_amount: String,
        pub is_active: bool,
        pub updated_at: String,
    }

    impl DbRate {
        pub fn into_domain(self) -> Result<ExchangeRate, RepoError> {
            Ok(ExchangeRate {
                id: RateId::from_uuid(parse_uuid(&self.id)?),
                branch_id: BranchId::from_uuid(parse_uuid(&self.branch_id)?),
                from_currency: parse_code(&self.from_currency)?,
                to_currency: parse_code(&self.to_currency)?,
                rate: parse_decimal(&self.rate)?,
                min_amount: parse_decimal(&self.min_amount)?,
                is_active: self.is_active,
                updated_at: parse_time(&self.updated_at)?,
            })
        }
    }

    /// Balance row with the optimistic-lock version.
    #[derive(FromRow)]
    pub struct DbBalance {
        pub id: String,
        pub branch_id: String,
        pub currency: String,
        pub amount: String,
        pub average_purchase_rate: String,
        pub version: i64,
        pub updated_at: String,
    }

    impl DbBalance {
        pub fn into_domain(self) -> Result<CurrencyBalance, RepoError> {
            Ok(CurrencyBalance {
                id: BalanceId::from_uuid(parse_uuid(&self.id)?),
                branch_id: BranchId::from_uuid(parse_uuid(&self.branch_id)?),
                currency: parse_code(&self.currency)?,
                amount: parse_decimal(&self.amount)?,
                average_purchase_rate: parse_decimal(&self.average_purchase_rate)?,
                updated_at: parse_time(&self.updated_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbOrder {
        pub id: String,
        pub tracking_code: String,
        pub user_id: Option<String>,
        pub branch_id: String,
        pub status: String,
        pub client_email: String,
        pub client_phone: Option<String>,
        pub delivery_address: Option<String>,
        pub operator_id: Option<String>,
        pub created_at: String,
        pub updated_at: String,
    }

    impl DbOrder {
        pub fn into_domain(
            self,
            items: Vec<OrderItem>,
            documents: Vec<OrderDocument>,
        ) -> Result<Order, RepoError> {
            Ok(Order {
                id: OrderId::from_uuid(parse_uuid(&self.id)?),
                tracking_code: TrackingCode::parse(&self.tracking_code)
                    .map_err(|_| corrupt("tracking code", &self.tracking_code))?,
                user_id: parse_opt_uuid(self.user_id.as_deref())?.map(UserId::from_uuid),
                branch_id: BranchId::from_uuid(parse_uuid(&self.branch_id)?),
                status: parse_enum("order status", &self.status)?,
                client_email: self.client_email,
                client_phone: self.client_phone,
                delivery_address: self.delivery_address,
                operator_id: parse_opt_uuid(self.operator_id.as_deref())?.map(UserId::from_uuid),
                items,
                documents,
                created_at: parse_time(&self.created_at)?,
                updated_at: parse_time(&self.updated_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbOrderItem {
        pub order_id: String,
        pub position: i64,
        pub from_currency: String,
        pub to_currency: String,
        pub from_amount: String,
        pub to_amount: String,
        pub rate: String,
    }

    impl DbOrderItem {
        pub fn into_domain(self) -> Result<OrderItem, RepoError> {
            Ok(OrderItem {
                position: u32::try_from(self.position)
                    .map_err(|_| corrupt("item position", &self.position.to_string()))?,
                from_currency: parse_code(&self.from_currency)?,
                to_currency: parse_code(&self.to_currency)?,
                from_amount: parse_decimal(&self.from_amount)?,
                to_amount: parse_decimal(&self.to_amount)?,
                rate: parse_decimal(&self.rate)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbDocument {
        pub id: String,
        pub order_id: String,
        pub doc_type: String,
        pub file_handle: String,
        pub uploaded_by: Option<String>,
        pub uploaded_at: String,
    }

    impl DbDocument {
        pub fn into_domain(self) -> Result<OrderDocument, RepoError> {
            Ok(OrderDocument {
                id: DocumentId::from_uuid(parse_uuid(&self.id)?),
                order_id: OrderId::from_uuid(parse_uuid(&self.order_id)?),
                doc_type: parse_enum("document type", &self.doc_type)?,
                file_handle: self.file_handle,
                uploaded_by: parse_opt_uuid(self.uploaded_by.as_deref())?.map(UserId::from_uuid),
                uploaded_at: parse_time(&self.uploaded_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbReview {
        pub id: String,
        pub order_id: String,
        pub user_id: String,
        pub rating: i64,
        pub text: String,
        pub is_visible: bool,
        pub created_at: String,
    }

    impl DbReview {
        pub fn into_domain(self) -> Result<Review, RepoError> {
            Ok(Review {
                id: ReviewId::from_uuid(parse_uuid(&self.id)?),
                order_id: OrderId::from_uuid(parse_uuid(&self.order_id)?),
                user_id: UserId::from_uuid(parse_uuid(&self.user_id)?),
                rating: u8::try_from(self.rating)
                    .map_err(|_| corrupt("rating", &self.rating.to_string()))?,
                text: self.text,
                is_visible: self.is_visible,
                created_at: parse_time(&self.created_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbUser {
        pub id: String,
        pub external_id: String,
        pub email: String,
        pub username: String,
        pub first_name: Option<String>,
        pub last_name: Option<String>,
        pub phone: Option<String>,
        pub telegram: Option<String>,
        pub referral_code: String,
        pub referred_by: Option<String>,
        pub referral_balance: String,
        pub created_at: String,
    }

    impl DbUser {
        pub fn into_domain(self, roles: Vec<String>) -> Result<User, RepoError> {
            Ok(User {
                id: UserId::from_uuid(parse_uuid(&self.id)?),
                external_id: self.external_id,
                email: self.email,
                username: self.username,
                first_name: self.first_name,
                last_name: self.last_name,
                phone: self.phone,
                telegram: self.telegram,
                referral_code: self.referral_code,
                referred_by: parse_opt_uuid(self.referred_by.as_deref())?.map(UserId::from_uuid),
                referral_balance: parse_decimal(&self.referral_balance)?,
                roles: roles
                    .iter()
                    .map(|r| parse_enum("role", r))
                    .collect::<Result<_, _>>()?,
                created_at: parse_time(&self.created_at)?,
            })
        }
    }

    #[derive(FromRow)]
    pub struct DbNotification {
        pub id: String,
        pub event_type: String,
        pub payload: String,
        pub status: String,
        pub created_at: String,
        pub available_at: String,
        pub processed_at: Option<String>,
        pub attempts: i32,
        pub last_error: Option<String>,
    }

    impl DbNotification {
        pub fn into_domain(self) -> Result<Notification, RepoError> {
            Ok(Notification {
                id: parse_uuid(&self.id)?,
                event_type: self.event_type,
                payload: serde_json::from_str(&self.payload)
                    .map_err(|_| corrupt("notification payload", &self.payload))?,
                status: parse_enum("notification status", &self.status)?,
                created_at: parse_time(&self.created_at)?,
                available_at: parse_time(&self.available_at)?,
                processed_at: self.processed_at.as_deref().map(parse_time).transpose()?,
                attempts: self.attempts,
                last_error: self.last_error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_round_trip_and_sort() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(5);
        let (a, b) = (ts(earlier), ts(later));
        assert!(a < b);
        assert_eq!(parse_time(&a).unwrap().timestamp_micros(), earlier.timestamp_micros());
    }

    #[test]
    fn test_decimal_text_is_exact() {
        let value = parse_decimal("12.345600").unwrap();
        assert_eq!(value.to_string(), "12.345600");
        assert!(parse_decimal("abc").is_err());
    }
}
