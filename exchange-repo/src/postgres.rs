//! PostgreSQL repository adapter.
#![allow(clippy::collapsible_if)]

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use exchange_types::{
    AttachDocumentRequest, Branch, BranchId, CreateBranchRequest, CreateCurrencyRequest,
    CreateOrderRequest, CreateRateRequest, CreateReviewRequest, Currency, CurrencyBalance,
    CurrencyCode, DomainError, ExchangeRate, ExchangeRepository, Identity, Notification,
    NotificationStatus, Order, OrderDocument, OrderId, OrderItem, OrderScope, OrderStatus, RateFilter,
    RateId, RecordPurchaseRequest, RepoError, Review, ReviewId, ReviewScope, Role, TrackingCode,
    UpdateCurrencyRequest, UpdateProfileRequest, UpdateRateRequest, User, UserId,
};

use crate::types::pg::{
    DbBalance, DbBranch, DbDocument, DbNotification, DbOrder, DbOrderItem, DbRate, DbReview, DbUser,
};
use crate::types::{
    BALANCE_COLUMNS, BRANCH_COLUMNS, CURRENCY_COLUMNS, DOCUMENT_COLUMNS, DbCurrency, ITEM_COLUMNS,
    NOTIFICATION_COLUMNS, ORDER_COLUMNS, RATE_COLUMNS, REVIEW_COLUMNS, USER_COLUMNS, db_err,
    parse_enum, race_err, tx_err, write_err,
};

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL Repository
// ─────────────────────────────────────────────────────────────────────────────

/// PostgreSQL repository with row-level locking.
pub struct PostgresRepo {
    pool: PgPool,
}

/// Executes SQL statements from a migration file, splitting by semicolons.
async fn execute_migration(pool: &PgPool, sql: &str, name: &str) -> Result<(), anyhow::Error> {
    for statement in sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| anyhow::anyhow!("Migration {} failed: {}", name, e))?;
        }
    }
    Ok(())
}

/// Runs all database migrations.
async fn run_migrations(pool: &PgPool) -> Result<(), anyhow::Error> {
    execute_migration(
        pool,
        include_str!("../migrations/0001_create_catalog_pg.sql"),
        "0001",
    )
    .await?;

    execute_migration(
        pool,
        include_str!("../migrations/0002_create_orders_pg.sql"),
        "0002",
    )
    .await?;

    execute_migration(
        pool,
        include_str!("../migrations/0003_create_notifications_pg.sql"),
        "0003",
    )
    .await?;

    Ok(())
}

impl PostgresRepo {
    /// Creates a new PostgreSQL repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the database schema (for testing with existing pool).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, RepoError> {
        self.pool.acquire().await.map_err(db_err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Row-lock suffix for reads that precede a write in the same transaction.
const LOCK: &str = "FOR UPDATE";
const NO_LOCK: &str = "";

async fn fetch_currency(
    conn: &mut PgConnection,
    code: CurrencyCode,
) -> Result<Option<Currency>, RepoError> {
    let sql = format!("SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = $1");
    let row: Option<DbCurrency> = sqlx::query_as(&sql)
        .bind(code.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbCurrency::into_domain).transpose()
}

async fn require_active_currency(
    conn: &mut PgConnection,
    code: CurrencyCode,
) -> Result<Currency, RepoError> {
    match fetch_currency(conn, code).await? {
        Some(c) if c.is_active => Ok(c),
        Some(_) => Err(DomainError::Validation(format!("Currency {} is not active", code)).into()),
        None => Err(DomainError::Validation(format!("Unknown currency: {}", code)).into()),
    }
}

async fn fetch_branch(conn: &mut PgConnection, id: BranchId) -> Result<Option<Branch>, RepoError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = $1");
    let row: Option<DbBranch> = sqlx::query_as(&sql)
        .bind(id.into_uuid())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbBranch::into_domain).transpose()
}

async fn fetch_rate(
    conn: &mut PgConnection,
    id: RateId,
    lock: &str,
) -> Result<Option<ExchangeRate>, RepoError> {
    let sql = format!("SELECT {RATE_COLUMNS} FROM exchange_rates WHERE id = $1 {lock}");
    let row: Option<DbRate> = sqlx::query_as(&sql)
        .bind(id.into_uuid())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbRate::into_domain).transpose()
}

async fn fetch_active_rate(
    conn: &mut PgConnection,
    branch_id: BranchId,
    from: CurrencyCode,
    to: CurrencyCode,
) -> Result<Option<ExchangeRate>, RepoError> {
    let sql = format!(
        "SELECT {RATE_COLUMNS} FROM exchange_rates
         WHERE branch_id = $1 AND from_currency = $2 AND to_currency = $3 AND is_active"
    );
    let row: Option<DbRate> = sqlx::query_as(&sql)
        .bind(branch_id.into_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbRate::into_domain).transpose()
}

async fn load_order(conn: &mut PgConnection, row: DbOrder) -> Result<Order, RepoError> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM order_items i WHERE i.order_id = $1 ORDER BY i.position"
    );
    let items: Vec<DbOrderItem> = sqlx::query_as(&sql)
        .bind(row.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM order_documents d WHERE d.order_id = $1 ORDER BY d.uploaded_at"
    );
    let documents: Vec<DbDocument> = sqlx::query_as(&sql)
        .bind(row.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let items = items
        .into_iter()
        .map(DbOrderItem::into_domain)
        .collect::<Result<_, _>>()?;
    let documents = documents
        .into_iter()
        .map(DbDocument::into_domain)
        .collect::<Result<_, _>>()?;
    row.into_domain(items, documents)
}

async fn fetch_order(
    conn: &mut PgConnection,
    id: OrderId,
    lock: &str,
) -> Result<Option<Order>, RepoError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 {lock}");
    let row: Option<DbOrder> = sqlx::query_as(&sql)
        .bind(id.into_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match row {
        Some(row) => load_order(conn, row).await.map(Some),
        None => Ok(None),
    }
}

async fn load_roles(conn: &mut PgConnection, user_id: Uuid) -> Result<Vec<String>, RepoError> {
    sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role")
        .bind(user_id)
        .fetch_all(conn)
        .await
        .map_err(db_err)
}

async fn load_user(conn: &mut PgConnection, row: Option<DbUser>) -> Result<Option<User>, RepoError> {
    match row {
        Some(row) => {
            let roles = load_roles(conn, row.id).await?;
            row.into_domain(roles).map(Some)
        }
        None => Ok(None),
    }
}

async fn fetch_user(
    conn: &mut PgConnection,
    id: UserId,
    lock: &str,
) -> Result<Option<User>, RepoError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 {lock}");
    let row: Option<DbUser> = sqlx::query_as(&sql)
        .bind(id.into_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    load_user(conn, row).await
}

async fn fetch_user_by(
    conn: &mut PgConnection,
    column: &str,
    value: &str,
) -> Result<Option<User>, RepoError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
    let row: Option<DbUser> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    load_user(conn, row).await
}

async fn insert_notification(
    conn: &mut PgConnection,
    notification: &Notification,
) -> Result<(), RepoError> {
    sqlx::query(
        r#"INSERT INTO notifications (id, event_type, payload, status, created_at, available_at, attempts)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(notification.id)
    .bind(&notification.event_type)
    .bind(&notification.payload)
    .bind(notification.status.as_ref())
    .bind(notification.created_at)
    .bind(notification.available_at)
    .bind(notification.attempts)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl ExchangeRepository for PostgresRepo {
    // ─────────────────────────────────────────────────────────────────────────
    // Currencies
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_currency(&self, req: CreateCurrencyRequest) -> Result<Currency, RepoError> {
        let currency = Currency::new(req.code, req.name, req.symbol, req.decimal_places)?;

        sqlx::query(
            r#"INSERT INTO currencies (code, name, symbol, decimal_places, is_active) VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(currency.code.as_str())
        .bind(&currency.name)
        .bind(&currency.symbol)
        .bind(currency.decimal_places as i32)
        .bind(currency.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, &format!("Currency {} already exists", currency.code)))?;

        Ok(currency)
    }

    async fn get_currency(&self, code: CurrencyCode) -> Result<Option<Currency>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_currency(&mut conn, code).await
    }

    async fn list_currencies(&self, include_inactive: bool) -> Result<Vec<Currency>, RepoError> {
        let sql = format!(
            "SELECT {CURRENCY_COLUMNS} FROM currencies WHERE $1 OR is_active ORDER BY code"
        );
        let rows: Vec<DbCurrency> = sqlx::query_as(&sql)
            .bind(include_inactive)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbCurrency::into_domain).collect()
    }

    async fn update_currency(
        &self,
        code: CurrencyCode,
        req: UpdateCurrencyRequest,
    ) -> Result<Currency, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let sql = format!("SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = $1 FOR UPDATE");
        let row: Option<DbCurrency> = sqlx::query_as(&sql)
            .bind(code.as_str())
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(db_err)?;
        let mut currency = row.ok_or(RepoError::NotFound)?.into_domain()?;
        currency.apply_update(req)?;

        sqlx::query(
            r#"UPDATE currencies SET name = $1, symbol = $2, decimal_places = $3, is_active = $4 WHERE code = $5"#,
        )
        .bind(&currency.name)
        .bind(&currency.symbol)
        .bind(currency.decimal_places as i32)
        .bind(currency.is_active)
        .bind(code.as_str())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(currency)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Branches
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_branch(&self, req: CreateBranchRequest) -> Result<Branch, RepoError> {
        let now = Utc::now();
        let branch = Branch {
            id: BranchId::new(),
            name: req.name.trim().to_string(),
            city: req.city.trim().to_string(),
            address: req.address.trim().to_string(),
            phone: req.phone.trim().to_string(),
            email: req.email.trim().to_string(),
            is_active: true,
            base_currency: req.base_currency,
            manager_id: req.manager_id,
            working_hours: req.working_hours,
            created_at: now,
            updated_at: now,
        };
        branch.validate()?;

        let working_hours = serde_json::to_value(&branch.working_hours)
            .map_err(|e| RepoError::Database(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO branches (id, name, city, address, phone, email, is_active, base_currency, manager_id, working_hours, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(branch.id.into_uuid())
        .bind(&branch.name)
        .bind(&branch.city)
        .bind(&branch.address)
        .bind(&branch.phone)
        .bind(&branch.email)
        .bind(branch.is_active)
        .bind(branch.base_currency.as_str())
        .bind(branch.manager_id.map(UserId::into_uuid))
        .bind(working_hours)
        .bind(branch.created_at)
        .bind(branch.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, "Branch already exists"))?;

        Ok(branch)
    }

    async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_branch(&mut conn, id).await
    }

    async fn list_branches(&self) -> Result<Vec<Branch>, RepoError> {
        let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches ORDER BY name");
        let rows: Vec<DbBranch> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbBranch::into_domain).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rates
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_rate(&self, req: CreateRateRequest) -> Result<ExchangeRate, RepoError> {
        let rate = ExchangeRate::new(
            req.branch_id,
            req.from_currency,
            req.to_currency,
            req.rate,
            req.min_amount,
        )?;

        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        if fetch_branch(&mut db_tx, rate.branch_id).await?.is_none() {
            return Err(
                DomainError::Validation(format!("Unknown branch: {}", rate.branch_id)).into(),
            );
        }
        require_active_currency(&mut db_tx, rate.from_currency).await?;
        require_active_currency(&mut db_tx, rate.to_currency).await?;

        sqlx::query(
            r#"INSERT INTO exchange_rates (id, branch_id, from_currency, to_currency, rate, min_amount, is_active, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(rate.id.into_uuid())
        .bind(rate.branch_id.into_uuid())
        .bind(rate.from_currency.as_str())
        .bind(rate.to_currency.as_str())
        .bind(rate.rate)
        .bind(rate.min_amount)
        .bind(rate.is_active)
        .bind(rate.updated_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| {
            write_err(
                e,
                &format!(
                    "A rate for {} -> {} already exists at this branch",
                    rate.from_currency, rate.to_currency
                ),
            )
        })?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(rate)
    }

    async fn update_rate(
        &self,
        id: RateId,
        req: UpdateRateRequest,
    ) -> Result<ExchangeRate, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut rate = fetch_rate(&mut db_tx, id, LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;
        rate.update(req.rate, req.min_amount, req.is_active)?;

        sqlx::query(
            r#"UPDATE exchange_rates SET rate = $1, min_amount = $2, is_active = $3, updated_at = $4 WHERE id = $5"#,
        )
        .bind(rate.rate)
        .bind(rate.min_amount)
        .bind(rate.is_active)
        .bind(rate.updated_at)
        .bind(id.into_uuid())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(rate)
    }

    async fn get_rate(&self, id: RateId) -> Result<Option<ExchangeRate>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_rate(&mut conn, id, NO_LOCK).await
    }

    async fn find_active_rate(
        &self,
        branch_id: BranchId,
        from: CurrencyCode,
        to: CurrencyCode,
    ) -> Result<Option<ExchangeRate>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_active_rate(&mut conn, branch_id, from, to).await
    }

    async fn list_rates(&self, filter: RateFilter) -> Result<Vec<ExchangeRate>, RepoError> {
        let sql = format!(
            "SELECT {RATE_COLUMNS} FROM exchange_rates
             WHERE ($1::uuid IS NULL OR branch_id = $1) AND ($2 OR is_active)
             ORDER BY branch_id, from_currency, to_currency"
        );
        let rows: Vec<DbRate> = sqlx::query_as(&sql)
            .bind(filter.branch_id.map(BranchId::into_uuid))
            .bind(filter.include_inactive)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbRate::into_domain).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Balances
    // ─────────────────────────────────────────────────────────────────────────

    async fn list_balances(&self, branch_id: BranchId) -> Result<Vec<CurrencyBalance>, RepoError> {
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM currency_balances WHERE branch_id = $1 ORDER BY currency"
        );
        let rows: Vec<DbBalance> = sqlx::query_as(&sql)
            .bind(branch_id.into_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbBalance::into_domain).collect()
    }

    async fn record_purchase(
        &self,
        branch_id: BranchId,
        req: RecordPurchaseRequest,
    ) -> Result<CurrencyBalance, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        if fetch_branch(&mut db_tx, branch_id).await?.is_none() {
            return Err(RepoError::NotFound);
        }
        if fetch_currency(&mut db_tx, req.currency).await?.is_none() {
            return Err(
                DomainError::Validation(format!("Unknown currency: {}", req.currency)).into(),
            );
        }

        sqlx::query(
            r#"INSERT INTO currency_balances (id, branch_id, currency, amount, average_purchase_rate, version, updated_at)
               VALUES ($1, $2, $3, 0, 0, 0, $4)
               ON CONFLICT (branch_id, currency) DO NOTHING"#,
        )
        .bind(Uuid::new_v4())
        .bind(branch_id.into_uuid())
        .bind(req.currency.as_str())
        .bind(Utc::now())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        // Lock the balance row; concurrent purchases queue here
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM currency_balances WHERE branch_id = $1 AND currency = $2 FOR UPDATE"
        );
        let row: DbBalance = sqlx::query_as(&sql)
            .bind(branch_id.into_uuid())
            .bind(req.currency.as_str())
            .fetch_one(&mut *db_tx)
            .await
            .map_err(db_err)?;

        let mut balance = row.into_domain()?;
        balance.record_purchase(req.amount, req.rate)?;

        sqlx::query(
            r#"UPDATE currency_balances
               SET amount = $1, average_purchase_rate = $2, version = version + 1, updated_at = $3
               WHERE id = $4"#,
        )
        .bind(balance.amount)
        .bind(balance.average_purchase_rate)
        .bind(balance.updated_at)
        .bind(balance.id.into_uuid())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(balance)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_order(
        &self,
        user_id: Option<UserId>,
        req: CreateOrderRequest,
    ) -> Result<Order, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let branch = fetch_branch(&mut db_tx, req.branch_id)
            .await?
            .ok_or_else(|| DomainError::Validation(format!("Unknown branch: {}", req.branch_id)))?;
        if !branch.is_active {
            return Err(
                DomainError::Validation("Branch is not accepting orders".into()).into(),
            );
        }

        let mut items = Vec::with_capacity(req.items.len());
        for (position, item) in req.items.iter().enumerate() {
            if item.from_currency == item.to_currency {
                return Err(DomainError::Validation(
                    "Source and target currencies must differ".into(),
                )
                .into());
            }
            let rate = fetch_active_rate(&mut db_tx, branch.id, item.from_currency, item.to_currency)
                .await?
                .ok_or(DomainError::RateNotFound {
                    branch_id: branch.id,
                    from: item.from_currency,
                    to: item.to_currency,
                })?;
            items.push(OrderItem::price(position as u32, &rate, item.from_amount)?);
        }

        let order = Order::new(
            branch.id,
            user_id,
            req.client_email,
            req.client_phone,
            req.delivery_address,
            items,
        )?;

        sqlx::query(
            r#"INSERT INTO orders (id, tracking_code, user_id, branch_id, status, client_email, client_phone, delivery_address, operator_id, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $10)"#,
        )
        .bind(order.id.into_uuid())
        .bind(order.tracking_code.as_str())
        .bind(order.user_id.map(UserId::into_uuid))
        .bind(order.branch_id.into_uuid())
        .bind(order.status.as_str())
        .bind(&order.client_email)
        .bind(&order.client_phone)
        .bind(&order.delivery_address)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| race_err(e, "Tracking code collision, please retry"))?;

        for item in &order.items {
            sqlx::query(
                r#"INSERT INTO order_items (order_id, position, from_currency, to_currency, from_amount, to_amount, rate)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(order.id.into_uuid())
            .bind(item.position as i32)
            .bind(item.from_currency.as_str())
            .bind(item.to_currency.as_str())
            .bind(item.from_amount)
            .bind(item.to_amount)
            .bind(item.rate)
            .execute(&mut *db_tx)
            .await
            .map_err(db_err)?;
        }

        insert_notification(&mut db_tx, &Notification::order_created(&order)).await?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_order(&mut conn, id, NO_LOCK).await
    }

    async fn get_order_by_tracking_code(
        &self,
        code: &TrackingCode,
    ) -> Result<Option<Order>, RepoError> {
        let mut conn = self.conn().await?;

        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE tracking_code = $1");
        let row: Option<DbOrder> = sqlx::query_as(&sql)
            .bind(code.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => load_order(&mut conn, row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn list_orders(&self, scope: OrderScope) -> Result<Vec<Order>, RepoError> {
        let user = match scope {
            OrderScope::All => None,
            OrderScope::User(id) => Some(id.into_uuid()),
        };
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE ($1::uuid IS NULL OR user_id = $1)
             ORDER BY created_at DESC"
        );
        let rows: Vec<DbOrder> = sqlx::query_as(&sql)
            .bind(user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM order_items i JOIN orders o ON o.id = i.order_id
             WHERE ($1::uuid IS NULL OR o.user_id = $1)
             ORDER BY i.position"
        );
        let items: Vec<DbOrderItem> = sqlx::query_as(&sql)
            .bind(user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM order_documents d JOIN orders o ON o.id = d.order_id
             WHERE ($1::uuid IS NULL OR o.user_id = $1)
             ORDER BY d.uploaded_at"
        );
        let documents: Vec<DbDocument> = sqlx::query_as(&sql)
            .bind(user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut items_by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in items {
            let order_id = row.order_id;
            items_by_order
                .entry(order_id)
                .or_default()
                .push(row.into_domain()?);
        }
        let mut documents_by_order: HashMap<Uuid, Vec<OrderDocument>> = HashMap::new();
        for row in documents {
            let order_id = row.order_id;
            documents_by_order
                .entry(order_id)
                .or_default()
                .push(row.into_domain()?);
        }

        rows.into_iter()
            .map(|row| {
                let order_items = items_by_order.remove(&row.id).unwrap_or_default();
                let order_documents = documents_by_order.remove(&row.id).unwrap_or_default();
                row.into_domain(order_items, order_documents)
            })
            .collect()
    }

    async fn transition_order(
        &self,
        id: OrderId,
        target: OrderStatus,
        operator_id: Option<UserId>,
    ) -> Result<Order, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        // Row lock serializes concurrent transitions of the same order
        let mut order = fetch_order(&mut db_tx, id, LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;
        let previous = order.transition(target)?;
        order.operator_id = operator_id.or(order.operator_id);

        let result = sqlx::query(
            r#"UPDATE orders SET status = $1, operator_id = $2, updated_at = $3 WHERE id = $4 AND status = $5"#,
        )
        .bind(order.status.as_str())
        .bind(order.operator_id.map(UserId::into_uuid))
        .bind(order.updated_at)
        .bind(id.into_uuid())
        .bind(previous.as_str())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(
                "Order status was changed concurrently".into(),
            ));
        }

        insert_notification(&mut db_tx, &Notification::status_changed(&order, previous)).await?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(order)
    }

    async fn delete_order(&self, id: OrderId) -> Result<(), RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(id.into_uuid())
                .fetch_optional(&mut *db_tx)
                .await
                .map_err(db_err)?;
        let status: OrderStatus = parse_enum("order status", &status.ok_or(RepoError::NotFound)?)?;
        if status != OrderStatus::New {
            return Err(DomainError::Validation(format!(
                "Only new orders can be deleted, this one is {}",
                status
            ))
            .into());
        }

        sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id.into_uuid())
            .execute(&mut *db_tx)
            .await
            .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(())
    }

    async fn attach_document(
        &self,
        order_id: OrderId,
        req: AttachDocumentRequest,
        uploaded_by: Option<UserId>,
    ) -> Result<OrderDocument, RepoError> {
        let document = OrderDocument::new(order_id, req.doc_type, req.file_handle, uploaded_by)?;

        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM orders WHERE id = $1")
            .bind(order_id.into_uuid())
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(RepoError::NotFound);
        }

        sqlx::query(
            r#"INSERT INTO order_documents (id, order_id, doc_type, file_handle, uploaded_by, uploaded_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(document.id.into_uuid())
        .bind(order_id.into_uuid())
        .bind(document.doc_type.as_str())
        .bind(&document.file_handle)
        .bind(document.uploaded_by.map(UserId::into_uuid))
        .bind(document.uploaded_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| {
            write_err(
                e,
                &format!("A {} document is already attached to this order", document.doc_type),
            )
        })?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(document)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_review(
        &self,
        user_id: UserId,
        req: CreateReviewRequest,
    ) -> Result<Review, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let order = fetch_order(&mut db_tx, req.order_id, NO_LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;
        let review = Review::new(&order, user_id, req.rating, req.text)?;

        sqlx::query(
            r#"INSERT INTO reviews (id, order_id, user_id, rating, text, is_visible, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(review.id.into_uuid())
        .bind(review.order_id.into_uuid())
        .bind(review.user_id.into_uuid())
        .bind(review.rating as i16)
        .bind(&review.text)
        .bind(review.is_visible)
        .bind(review.created_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| write_err(e, "This order already has a review"))?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(review)
    }

    async fn list_reviews(&self, scope: ReviewScope) -> Result<Vec<Review>, RepoError> {
        let (visible_only, user) = match scope {
            ReviewScope::Public => (true, None),
            ReviewScope::All => (false, None),
            ReviewScope::User(id) => (false, Some(id.into_uuid())),
        };
        let sql = format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews
             WHERE (NOT $1 OR is_visible) AND ($2::uuid IS NULL OR user_id = $2)
             ORDER BY created_at DESC"
        );
        let rows: Vec<DbReview> = sqlx::query_as(&sql)
            .bind(visible_only)
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbReview::into_domain).collect()
    }

    async fn set_review_visibility(
        &self,
        id: ReviewId,
        is_visible: bool,
    ) -> Result<Review, RepoError> {
        let sql = format!(
            "UPDATE reviews SET is_visible = $1 WHERE id = $2 RETURNING {REVIEW_COLUMNS}"
        );
        let row: Option<DbReview> = sqlx::query_as(&sql)
            .bind(is_visible)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.ok_or(RepoError::NotFound)?.into_domain()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    async fn upsert_identity(&self, identity: Identity) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        if let Some(user) = fetch_user_by(&mut db_tx, "external_id", &identity.external_id).await? {
            db_tx.commit().await.map_err(tx_err)?;
            return Ok(user);
        }

        let email = identity.email.trim().to_lowercase();
        if let Some(mut user) = fetch_user_by(&mut db_tx, "email", &email).await? {
            sqlx::query("UPDATE users SET external_id = $1 WHERE id = $2")
                .bind(&identity.external_id)
                .bind(user.id.into_uuid())
                .execute(&mut *db_tx)
                .await
                .map_err(|e| race_err(e, "Identity is already linked"))?;
            db_tx.commit().await.map_err(tx_err)?;
            user.external_id = identity.external_id;
            return Ok(user);
        }

        let user = User::from_identity(&identity)?;
        sqlx::query(
            r#"INSERT INTO users (id, external_id, email, username, referral_code, referral_balance, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(user.id.into_uuid())
        .bind(&user.external_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.referral_code)
        .bind(user.referral_balance)
        .bind(user.created_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| race_err(e, "User was registered concurrently"))?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_user(&mut conn, id, NO_LOCK).await
    }

    async fn update_profile(
        &self,
        id: UserId,
        req: UpdateProfileRequest,
    ) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut user = fetch_user(&mut db_tx, id, LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;
        user.apply_profile(req)?;

        sqlx::query(
            r#"UPDATE users SET username = $1, first_name = $2, last_name = $3, phone = $4, telegram = $5 WHERE id = $6"#,
        )
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(&user.telegram)
        .bind(id.into_uuid())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(user)
    }

    async fn set_roles(&self, id: UserId, roles: BTreeSet<Role>) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut user = fetch_user(&mut db_tx, id, LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;

        sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
            .bind(id.into_uuid())
            .execute(&mut *db_tx)
            .await
            .map_err(db_err)?;

        for role in &roles {
            sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2)")
                .bind(id.into_uuid())
                .bind(role.as_str())
                .execute(&mut *db_tx)
                .await
                .map_err(db_err)?;
        }

        db_tx.commit().await.map_err(tx_err)?;
        user.roles = roles;
        Ok(user)
    }

    async fn apply_referral(&self, id: UserId, referral_code: &str) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut user = fetch_user(&mut db_tx, id, LOCK)
            .await?
            .ok_or(RepoError::NotFound)?;
        let referrer = fetch_user_by(&mut db_tx, "referral_code", referral_code.trim())
            .await?
            .ok_or_else(|| DomainError::Validation("Unknown referral code".into()))?;
        user.apply_referral(&referrer)?;

        let result =
            sqlx::query("UPDATE users SET referred_by = $1 WHERE id = $2 AND referred_by IS NULL")
                .bind(referrer.id.into_uuid())
                .bind(id.into_uuid())
                .execute(&mut *db_tx)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(
                "A referral code has already been applied".into(),
            ));
        }

        db_tx.commit().await.map_err(tx_err)?;
        Ok(user)
    }

    async fn list_referrals(&self, id: UserId) -> Result<Vec<User>, RepoError> {
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE referred_by = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<DbUser> = sqlx::query_as(&sql)
            .bind(id.into_uuid())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let roles = load_roles(&mut conn, row.id).await?;
            users.push(row.into_domain(roles)?);
        }
        Ok(users)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notification Outbox
    // ─────────────────────────────────────────────────────────────────────────

    async fn claim_pending_notifications(
        &self,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<Notification>, RepoError> {
        // SKIP LOCKED lets several workers drain the outbox without double-sending.
        // Expired PROCESSING leases are claimed like due PENDING rows.
        let sql = format!(
            "UPDATE notifications SET status = 'PROCESSING', available_at = $1
             WHERE id IN (
                 SELECT id FROM notifications
                 WHERE status IN ('PENDING', 'PROCESSING') AND available_at <= NOW()
                 ORDER BY created_at ASC LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let rows: Vec<DbNotification> = sqlx::query_as(&sql)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut notifications = rows
            .into_iter()
            .map(DbNotification::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        notifications.sort_by_key(|n| n.created_at);
        Ok(notifications)
    }

    async fn mark_notification(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<String>,
        retry_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"UPDATE notifications
               SET status = $1, processed_at = $2, last_error = $3, available_at = $4,
                   attempts = attempts + 1
               WHERE id = $5"#,
        )
        .bind(status.as_ref())
        .bind(Utc::now())
        .bind(error)
        .bind(retry_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
