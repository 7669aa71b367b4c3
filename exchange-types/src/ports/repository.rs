//! Repository port trait.
//!
//! This is the primary port in our hexagonal architecture.
//! Adapters (Postgres, SQLite) implement this trait.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Branch, BranchId, Currency, CurrencyBalance, CurrencyCode, ExchangeRate, Identity,
    Notification, NotificationStatus, Order, OrderDocument, OrderId, OrderStatus, RateId, Review,
    ReviewId, Role, TrackingCode, User, UserId,
};
use crate::dto::{
    AttachDocumentRequest, CreateBranchRequest, CreateCurrencyRequest, CreateOrderRequest,
    CreateRateRequest, CreateReviewRequest, RateFilter, RecordPurchaseRequest,
    UpdateCurrencyRequest, UpdateProfileRequest, UpdateRateRequest,
};
use crate::error::RepoError;
use crate::policy::Actor;

/// Which orders a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    All,
    User(UserId),
}

impl OrderScope {
    /// Staff see every order, clients only their own.
    pub fn for_actor(actor: &Actor) -> Option<Self> {
        if actor.is_staff() {
            Some(Self::All)
        } else {
            actor.user_id.map(Self::User)
        }
    }
}

/// Which reviews a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    /// Published reviews only
    Public,
    All,
    /// Reviews of this user's orders
    User(UserId),
}

impl ReviewScope {
    /// Administrators and owners see every review, everyone else their own.
    pub fn for_actor(actor: &Actor) -> Option<Self> {
        if actor.has_any(&[Role::Administrator, Role::Owner]) {
            Some(Self::All)
        } else {
            actor.user_id.map(Self::User)
        }
    }
}

/// The main repository port for the exchange back office.
///
/// Order creation, status transitions and balance updates MUST be atomic.
/// Implementations use database transactions to ensure consistency and
/// report lost races as `RepoError::Conflict` without retrying.
#[async_trait::async_trait]
pub trait ExchangeRepository: Send + Sync + 'static {
    // ─────────────────────────────────────────────────────────────────────────────
    // Currencies
    // ─────────────────────────────────────────────────────────────────────────────

    async fn create_currency(&self, req: CreateCurrencyRequest) -> Result<Currency, RepoError>;

    async fn get_currency(&self, code: CurrencyCode) -> Result<Option<Currency>, RepoError>;

    async fn list_currencies(&self, include_inactive: bool) -> Result<Vec<Currency>, RepoError>;

    async fn update_currency(
        &self,
        code: CurrencyCode,
        req: UpdateCurrencyRequest,
    ) -> Result<Currency, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Branches
    // ─────────────────────────────────────────────────────────────────────────────

    async fn create_branch(&self, req: CreateBranchRequest) -> Result<Branch, RepoError>;

    async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>, RepoError>;

    async fn list_branches(&self) -> Result<Vec<Branch>, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Rates
    // ─────────────────────────────────────────────────────────────────────────────

    /// Fails with a validation error if the branch already prices this pair.
    async fn create_rate(&self, req: CreateRateRequest) -> Result<ExchangeRate, RepoError>;

    async fn update_rate(&self, id: RateId, req: UpdateRateRequest)
    -> Result<ExchangeRate, RepoError>;

    async fn get_rate(&self, id: RateId) -> Result<Option<ExchangeRate>, RepoError>;

    /// The active rate for a directed pair at a branch, if any.
    async fn find_active_rate(
        &self,
        branch_id: BranchId,
        from: CurrencyCode,
        to: CurrencyCode,
    ) -> Result<Option<ExchangeRate>, RepoError>;

    async fn list_rates(&self, filter: RateFilter) -> Result<Vec<ExchangeRate>, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Balances (MUST be atomic)
    // ─────────────────────────────────────────────────────────────────────────────

    async fn list_balances(&self, branch_id: BranchId) -> Result<Vec<CurrencyBalance>, RepoError>;

    /// Folds a purchase into the branch's holding of that currency.
    async fn record_purchase(
        &self,
        branch_id: BranchId,
        req: RecordPurchaseRequest,
    ) -> Result<CurrencyBalance, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Orders (MUST be atomic)
    // ─────────────────────────────────────────────────────────────────────────────

    /// Prices every item at the branch's active rate and stores the order,
    /// its items and an outbox notification in one transaction.
    async fn create_order(
        &self,
        user_id: Option<UserId>,
        req: CreateOrderRequest,
    ) -> Result<Order, RepoError>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, RepoError>;

    async fn get_order_by_tracking_code(
        &self,
        code: &TrackingCode,
    ) -> Result<Option<Order>, RepoError>;

    async fn list_orders(&self, scope: OrderScope) -> Result<Vec<Order>, RepoError>;

    /// Re-reads the order, applies the state machine and compare-and-swaps
    /// the status in one transaction.
    async fn transition_order(
        &self,
        id: OrderId,
        target: OrderStatus,
        operator_id: Option<UserId>,
    ) -> Result<Order, RepoError>;

    /// Deletes an order that is still `new`.
    async fn delete_order(&self, id: OrderId) -> Result<(), RepoError>;

    /// At most one document of each type per order.
    async fn attach_document(
        &self,
        order_id: OrderId,
        req: AttachDocumentRequest,
        uploaded_by: Option<UserId>,
    ) -> Result<OrderDocument, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────────

    async fn create_review(
        &self,
        user_id: UserId,
        req: CreateReviewRequest,
    ) -> Result<Review, RepoError>;

    async fn list_reviews(&self, scope: ReviewScope) -> Result<Vec<Review>, RepoError>;

    async fn set_review_visibility(
        &self,
        id: ReviewId,
        is_visible: bool,
    ) -> Result<Review, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finds the user by provider subject, then by email, creating one if
    /// neither matches.
    async fn upsert_identity(&self, identity: Identity) -> Result<User, RepoError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepoError>;

    async fn update_profile(
        &self,
        id: UserId,
        req: UpdateProfileRequest,
    ) -> Result<User, RepoError>;

    async fn set_roles(&self, id: UserId, roles: BTreeSet<Role>) -> Result<User, RepoError>;

    async fn apply_referral(&self, id: UserId, referral_code: &str) -> Result<User, RepoError>;

    async fn list_referrals(&self, id: UserId) -> Result<Vec<User>, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Notification Outbox
    // ─────────────────────────────────────────────────────────────────────────────

    /// Claims up to `limit` due notifications, marking them as processing.
    ///
    /// The claim holds until `lease_until`. Rows still `PROCESSING` after
    /// that belong to a worker that never reported back and are handed out
    /// again.
    async fn claim_pending_notifications(
        &self,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<Notification>, RepoError>;

    /// Records the outcome of one delivery attempt.
    ///
    /// A row put back to `PENDING` is not claimable before `retry_at`.
    async fn mark_notification(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
        retry_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;
}
