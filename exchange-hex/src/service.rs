//! Exchange Application Service
//!
//! Orchestrates domain operations through the repository port.
//! Every operation takes the calling [`Actor`] and asks the access policy
//! before touching the repository. Contains NO infrastructure logic.

use std::collections::HashMap;
use std::sync::Arc;

use exchange_rates::{convert, round_half_up};
use exchange_types::{
    AccessError, Action, Actor, AppError, ApplyReferralRequest, AttachDocumentRequest, Branch,
    BranchId, Conversion, CreateBranchRequest, CreateCurrencyRequest, CreateOrderRequest,
    CreateRateRequest, CreateReviewRequest, Currency, CurrencyBalance, CurrencyCode,
    CurrencyFilter, Direction, DomainError, ExchangeRate, ExchangeRepository, Identity, Order,
    OrderDocument, OrderId, OrderItemView, OrderResponse, OrderScope, QuoteRequest, RateFilter,
    RateId, RecordPurchaseRequest, ReferralEntry, Resource, Review, ReviewId, ReviewScope,
    SetRolesRequest, TrackingCode, TrackingResponse, UpdateCurrencyRequest,
    UpdateOrderStatusRequest, UpdateProfileRequest, UpdateRateRequest, UpdateReviewRequest, User,
    UserId, authorize,
};
use rust_decimal::Decimal;

/// Digits shown for a currency missing from the catalog.
const FALLBACK_DECIMAL_PLACES: u32 = 2;

/// Application service for the exchange back office.
///
/// Generic over `R: ExchangeRepository` - the adapter is injected at compile time.
/// The repository is shared so background workers can use the same pool.
pub struct ExchangeService<R: ExchangeRepository> {
    repo: Arc<R>,
}

impl<R: ExchangeRepository> ExchangeService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Returns a reference to the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────────

    /// Resolves a verified identity to an actor, registering the user on first sight.
    pub async fn identify(&self, identity: Identity) -> Result<Actor, AppError> {
        let user = self.repo.upsert_identity(identity).await?;
        Ok(Actor::from(&user))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Currencies
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn create_currency(
        &self,
        actor: &Actor,
        req: CreateCurrencyRequest,
    ) -> Result<Currency, AppError> {
        authorize(actor, Action::ManageCurrencies, Resource::Shared)?;
        Ok(self.repo.create_currency(req).await?)
    }

    pub async fn list_currencies(
        &self,
        actor: &Actor,
        filter: CurrencyFilter,
    ) -> Result<Vec<Currency>, AppError> {
        let action = if filter.include_inactive {
            Action::ManageCurrencies
        } else {
            Action::ReadCatalog
        };
        authorize(actor, action, Resource::Shared)?;
        Ok(self.repo.list_currencies(filter.include_inactive).await?)
    }

    pub async fn get_currency(&self, actor: &Actor, code: CurrencyCode) -> Result<Currency, AppError> {
        authorize(actor, Action::ReadCatalog, Resource::Shared)?;
        self.repo
            .get_currency(code)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Currency {}", code)))
    }

    pub async fn update_currency(
        &self,
        actor: &Actor,
        code: CurrencyCode,
        req: UpdateCurrencyRequest,
    ) -> Result<Currency, AppError> {
        authorize(actor, Action::ManageCurrencies, Resource::Shared)?;
        Ok(self.repo.update_currency(code, req).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Branches & Balances
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn create_branch(
        &self,
        actor: &Actor,
        req: CreateBranchRequest,
    ) -> Result<Branch, AppError> {
        authorize(actor, Action::ManageBranches, Resource::Shared)?;
        Ok(self.repo.create_branch(req).await?)
    }

    pub async fn list_branches(&self, actor: &Actor) -> Result<Vec<Branch>, AppError> {
        authorize(actor, Action::ReadCatalog, Resource::Shared)?;
        Ok(self.repo.list_branches().await?)
    }

    pub async fn get_branch(&self, actor: &Actor, id: BranchId) -> Result<Branch, AppError> {
        authorize(actor, Action::ReadCatalog, Resource::Shared)?;
        self.load_branch(id).await
    }

    pub async fn list_balances(
        &self,
        actor: &Actor,
        branch_id: BranchId,
    ) -> Result<Vec<CurrencyBalance>, AppError> {
        authorize(actor, Action::ViewBalances, Resource::Shared)?;
        self.load_branch(branch_id).await?;
        Ok(self.repo.list_balances(branch_id).await?)
    }

    /// Records a currency purchase, folding it into the weighted-average cost.
    pub async fn record_purchase(
        &self,
        actor: &Actor,
        branch_id: BranchId,
        req: RecordPurchaseRequest,
    ) -> Result<CurrencyBalance, AppError> {
        authorize(actor, Action::RecordPurchase, Resource::Shared)?;
        if req.amount <= Decimal::ZERO || req.rate <= Decimal::ZERO {
            return Err(DomainError::InvalidInput(
                "Purchase amount and rate must be positive".into(),
            )
            .into());
        }
        self.load_branch(branch_id).await?;
        Ok(self.repo.record_purchase(branch_id, req).await?)
    }

    async fn load_branch(&self, id: BranchId) -> Result<Branch, AppError> {
        self.repo
            .get_branch(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Branch {}", id)))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Rates
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn create_rate(
        &self,
        actor: &Actor,
        req: CreateRateRequest,
    ) -> Result<ExchangeRate, AppError> {
        authorize(actor, Action::ManageRates, Resource::Shared)?;
        Ok(self.repo.create_rate(req).await?)
    }

    pub async fn update_rate(
        &self,
        actor: &Actor,
        id: RateId,
        req: UpdateRateRequest,
    ) -> Result<ExchangeRate, AppError> {
        authorize(actor, Action::ManageRates, Resource::Shared)?;
        Ok(self.repo.update_rate(id, req).await?)
    }

    /// Lists rates. Deactivated rates are only listed for catalog managers.
    pub async fn list_rates(
        &self,
        actor: &Actor,
        filter: RateFilter,
    ) -> Result<Vec<ExchangeRate>, AppError> {
        let action = if filter.include_inactive {
            Action::ViewAllRates
        } else {
            Action::ReadCatalog
        };
        authorize(actor, action, Resource::Shared)?;
        Ok(self.repo.list_rates(filter).await?)
    }

    pub async fn get_rate(&self, actor: &Actor, id: RateId) -> Result<ExchangeRate, AppError> {
        authorize(actor, Action::ReadCatalog, Resource::Shared)?;
        let rate = self
            .repo
            .get_rate(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Rate {}", id)))?;

        // Hidden rates look absent to the public
        if !rate.is_active && authorize(actor, Action::ViewAllRates, Resource::Shared).is_err() {
            return Err(AppError::NotFound(format!("Rate {}", id)));
        }
        Ok(rate)
    }

    /// Prices an exchange at a rate in either direction.
    ///
    /// Amounts are rounded half-up to each currency's precision; the rate is not.
    #[tracing::instrument(skip(self, actor))]
    pub async fn quote(
        &self,
        actor: &Actor,
        id: RateId,
        req: QuoteRequest,
    ) -> Result<Conversion, AppError> {
        authorize(actor, Action::Quote, Resource::Shared)?;
        let rate = self
            .repo
            .get_rate(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Rate {}", id)))?;
        if !rate.is_active {
            return Err(DomainError::RateNotFound {
                branch_id: rate.branch_id,
                from: rate.from_currency,
                to: rate.to_currency,
            }
            .into());
        }

        let (direction, amount) =
            Direction::select(req.amount_from, req.amount_to).map_err(DomainError::from)?;
        let conversion = convert(&rate.quote(), direction, amount)
            .map_err(|e| DomainError::from_rate_error(e, rate.from_currency))?;

        let precision = self.precision().await?;
        Ok(conversion.rounded(
            precision.of(rate.from_currency),
            precision.of(rate.to_currency),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────────────────────────────────

    /// Places an order at the branch's current rates. Guests may order too.
    #[tracing::instrument(skip(self, actor, req), fields(branch_id = %req.branch_id, items = req.items.len()))]
    pub async fn create_order(
        &self,
        actor: &Actor,
        req: CreateOrderRequest,
    ) -> Result<OrderResponse, AppError> {
        authorize(actor, Action::CreateOrder, Resource::Shared)?;
        let order = self.repo.create_order(actor.user_id, req).await?;
        tracing::info!(order_id = %order.id, tracking_code = %order.tracking_code, "Order placed");
        self.order_response(order).await
    }

    pub async fn track_order(&self, actor: &Actor, code: &str) -> Result<TrackingResponse, AppError> {
        authorize(actor, Action::TrackOrder, Resource::Shared)?;
        let not_found = || AppError::NotFound(format!("Order with tracking code {}", code));
        let code = TrackingCode::parse(code).map_err(|_| not_found())?;
        let order = self
            .repo
            .get_order_by_tracking_code(&code)
            .await?
            .ok_or_else(not_found)?;

        let precision = self.precision().await?;
        Ok(TrackingResponse {
            tracking_code: order.tracking_code.clone(),
            status: order.status,
            status_display: order.status.display_name().to_string(),
            items: item_views(&order, &precision),
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }

    /// Staff see every order, clients only their own.
    pub async fn list_orders(&self, actor: &Actor) -> Result<Vec<OrderResponse>, AppError> {
        authorize(actor, Action::ListOrders, Resource::Shared)?;
        let scope = OrderScope::for_actor(actor).ok_or(AccessError::Unauthenticated)?;
        let orders = self.repo.list_orders(scope).await?;

        let precision = self.precision().await?;
        Ok(orders
            .into_iter()
            .map(|order| order_response(order, &precision))
            .collect())
    }

    pub async fn get_order(&self, actor: &Actor, id: OrderId) -> Result<OrderResponse, AppError> {
        let order = self.load_order(actor, Action::ViewOrder, id).await?;
        self.order_response(order).await
    }

    /// Moves an order along its lifecycle, recording the operator.
    #[tracing::instrument(skip(self, actor, req), fields(order_id = %id, target = %req.status))]
    pub async fn update_order_status(
        &self,
        actor: &Actor,
        id: OrderId,
        req: UpdateOrderStatusRequest,
    ) -> Result<OrderResponse, AppError> {
        authorize(actor, Action::ChangeOrderStatus, Resource::Shared)?;
        let order = self
            .repo
            .transition_order(id, req.status, actor.user_id)
            .await?;
        tracing::info!(status = %order.status, "Order status changed");
        self.order_response(order).await
    }

    pub async fn delete_order(&self, actor: &Actor, id: OrderId) -> Result<(), AppError> {
        authorize(actor, Action::DeleteOrder, Resource::Shared)?;
        Ok(self.repo.delete_order(id).await?)
    }

    pub async fn list_documents(
        &self,
        actor: &Actor,
        id: OrderId,
    ) -> Result<Vec<OrderDocument>, AppError> {
        let order = self.load_order(actor, Action::ViewOrder, id).await?;
        Ok(order.documents)
    }

    pub async fn attach_document(
        &self,
        actor: &Actor,
        id: OrderId,
        req: AttachDocumentRequest,
    ) -> Result<OrderDocument, AppError> {
        self.load_order(actor, Action::AttachDocument, id).await?;
        Ok(self.repo.attach_document(id, req, actor.user_id).await?)
    }

    /// Loads an order the actor may perform `action` on.
    async fn load_order(&self, actor: &Actor, action: Action, id: OrderId) -> Result<Order, AppError> {
        // Anonymous callers are turned away before the lookup
        actor.require_user()?;
        let order = self
            .repo
            .get_order(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {}", id)))?;
        authorize(actor, action, Resource::OwnedBy(order.user_id))?;
        Ok(order)
    }

    async fn order_response(&self, order: Order) -> Result<OrderResponse, AppError> {
        let precision = self.precision().await?;
        Ok(order_response(order, &precision))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn create_review(
        &self,
        actor: &Actor,
        req: CreateReviewRequest,
    ) -> Result<Review, AppError> {
        let user_id = actor.require_user()?;
        let order = self
            .repo
            .get_order(req.order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {}", req.order_id)))?;
        authorize(actor, Action::CreateReview, Resource::OwnedBy(order.user_id))?;
        Ok(self.repo.create_review(user_id, req).await?)
    }

    pub async fn list_public_reviews(&self, actor: &Actor) -> Result<Vec<Review>, AppError> {
        authorize(actor, Action::ListPublicReviews, Resource::Shared)?;
        Ok(self.repo.list_reviews(ReviewScope::Public).await?)
    }

    /// Moderators see every review, clients the reviews of their own orders.
    pub async fn list_reviews(&self, actor: &Actor) -> Result<Vec<Review>, AppError> {
        authorize(actor, Action::ListReviews, Resource::Shared)?;
        let scope = ReviewScope::for_actor(actor).ok_or(AccessError::Unauthenticated)?;
        Ok(self.repo.list_reviews(scope).await?)
    }

    pub async fn set_review_visibility(
        &self,
        actor: &Actor,
        id: ReviewId,
        req: UpdateReviewRequest,
    ) -> Result<Review, AppError> {
        authorize(actor, Action::ModerateReviews, Resource::Shared)?;
        Ok(self.repo.set_review_visibility(id, req.is_visible).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn me(&self, actor: &Actor) -> Result<User, AppError> {
        authorize(actor, Action::ManageProfile, Resource::Shared)?;
        let id = actor.require_user()?;
        self.repo
            .get_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", id)))
    }

    pub async fn update_me(
        &self,
        actor: &Actor,
        req: UpdateProfileRequest,
    ) -> Result<User, AppError> {
        authorize(actor, Action::ManageProfile, Resource::Shared)?;
        let id = actor.require_user()?;
        Ok(self.repo.update_profile(id, req).await?)
    }

    /// Links the caller to the owner of a referral code. Allowed once.
    pub async fn apply_referral(
        &self,
        actor: &Actor,
        req: ApplyReferralRequest,
    ) -> Result<User, AppError> {
        authorize(actor, Action::ManageProfile, Resource::Shared)?;
        let id = actor.require_user()?;
        let code = req.referral_code.trim();
        if code.is_empty() {
            return Err(AppError::BadRequest("Referral code cannot be empty".into()));
        }
        Ok(self.repo.apply_referral(id, code).await?)
    }

    pub async fn list_referrals(&self, actor: &Actor) -> Result<Vec<ReferralEntry>, AppError> {
        authorize(actor, Action::ManageProfile, Resource::Shared)?;
        let id = actor.require_user()?;
        let referrals = self.repo.list_referrals(id).await?;
        Ok(referrals
            .into_iter()
            .map(|user| ReferralEntry {
                id: user.id,
                username: user.username,
                joined_at: user.created_at,
            })
            .collect())
    }

    /// Replaces a user's role set.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %id))]
    pub async fn set_roles(
        &self,
        actor: &Actor,
        id: UserId,
        req: SetRolesRequest,
    ) -> Result<User, AppError> {
        authorize(actor, Action::ManageRoles, Resource::Shared)?;
        let user = self.repo.set_roles(id, req.roles).await?;
        tracing::info!(roles = ?user.roles, "Roles updated");
        Ok(user)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Presentation
    // ─────────────────────────────────────────────────────────────────────────────

    async fn precision(&self) -> Result<Precision, AppError> {
        let currencies = self.repo.list_currencies(true).await?;
        Ok(Precision(
            currencies
                .into_iter()
                .map(|c| (c.code, c.decimal_places))
                .collect(),
        ))
    }
}

/// Display precision per currency code.
struct Precision(HashMap<CurrencyCode, u32>);

impl Precision {
    fn of(&self, code: CurrencyCode) -> u32 {
        self.0
            .get(&code)
            .copied()
            .unwrap_or(FALLBACK_DECIMAL_PLACES)
    }
}

fn item_views(order: &Order, precision: &Precision) -> Vec<OrderItemView> {
    order
        .items
        .iter()
        .map(|item| OrderItemView {
            from_currency: item.from_currency,
            to_currency: item.to_currency,
            from_amount: round_half_up(item.from_amount, precision.of(item.from_currency)),
            to_amount: round_half_up(item.to_amount, precision.of(item.to_currency)),
            rate: item.rate,
        })
        .collect()
}

/// Totals add up the rounded item amounts, so they match the lines shown.
fn order_response(order: Order, precision: &Precision) -> OrderResponse {
    let items = item_views(&order, precision);
    let total_from_amount = items.iter().map(|i| i.from_amount).sum();
    let total_to_amount = items.iter().map(|i| i.to_amount).sum();

    OrderResponse {
        id: order.id,
        tracking_code: order.tracking_code,
        user_id: order.user_id,
        branch_id: order.branch_id,
        status: order.status,
        status_display: order.status.display_name().to_string(),
        client_email: order.client_email,
        client_phone: order.client_phone,
        delivery_address: order.delivery_address,
        operator_id: order.operator_id,
        items,
        documents: order.documents,
        total_from_amount,
        total_to_amount,
        allowed_transitions: order.status.allowed_transitions().to_vec(),
        created_at: order.created_at,
        updated_at: order.updated_at,
    }
}
