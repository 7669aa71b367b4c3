//! SQLite repository adapter.
//!
//! UUIDs, decimals and timestamps are stored as TEXT. SQLite has no row
//! locks, so balance updates are guarded by an optimistic `version` column.
#![allow(clippy::collapsible_if)]

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use exchange_types::{
    AttachDocumentRequest, Branch, BranchId, CreateBranchRequest, CreateCurrencyRequest,
    CreateOrderRequest, CreateRateRequest, CreateReviewRequest, Currency, CurrencyBalance,
    CurrencyCode, DomainError, ExchangeRate, ExchangeRepository, Identity, Notification,
    NotificationStatus, Order, OrderDocument, OrderId, OrderItem, OrderScope, OrderStatus, RateFilter,
    RateId, RecordPurchaseRequest, RepoError, Review, ReviewId, ReviewScope, Role, TrackingCode,
    UpdateCurrencyRequest, UpdateProfileRequest, UpdateRateRequest, User, UserId,
};

use crate::types::lite::{
    DbBalance, DbBranch, DbDocument, DbNotification, DbOrder, DbOrderItem, DbRate, DbReview, DbUser,
};
use crate::types::{
    BALANCE_COLUMNS, BRANCH_COLUMNS, CURRENCY_COLUMNS, DOCUMENT_COLUMNS, DbCurrency, ITEM_COLUMNS,
    NOTIFICATION_COLUMNS, ORDER_COLUMNS, RATE_COLUMNS, REVIEW_COLUMNS, USER_COLUMNS, db_err,
    parse_enum, race_err, ts, tx_err, write_err,
};

// ─────────────────────────────────────────────────────────────────────────────
// SQLite Repository
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite repository implementation.
pub struct SqliteRepo {
    pool: SqlitePool,
}

const MIGRATIONS: [(&str, &str); 3] = [
    ("0001", include_str!("../migrations/0001_create_catalog.sql")),
    ("0002", include_str!("../migrations/0002_create_orders.sql")),
    ("0003", include_str!("../migrations/0003_create_notifications.sql")),
];

async fn run_migrations(pool: &SqlitePool) -> Result<(), RepoError> {
    for (name, sql) in MIGRATIONS {
        for statement in sql.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await.map_err(|e| {
                    RepoError::Database(format!("Migration {} failed: {}", name, e))
                })?;
            }
        }
    }
    Ok(())
}

impl SqliteRepo {
    /// Creates a new SQLite repository with automatic migration.
    ///
    /// In-memory databases get a single long-lived connection, since every
    /// new connection would otherwise open an empty database.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure on-disk SQLite target directory exists (no-op for in-memory).
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.split('?').next().unwrap_or(path);
            if path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().connect_with(options).await?
        };

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Re-runs the (idempotent) schema migrations.
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        run_migrations(&self.pool).await
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>, RepoError> {
        self.pool.acquire().await.map_err(db_err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query helpers (work on a pooled connection or inside a transaction)
// ─────────────────────────────────────────────────────────────────────────────

async fn fetch_currency(
    conn: &mut SqliteConnection,
    code: CurrencyCode,
) -> Result<Option<Currency>, RepoError> {
    let sql = format!("SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = ?");
    let row: Option<DbCurrency> = sqlx::query_as(&sql)
        .bind(code.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbCurrency::into_domain).transpose()
}

async fn require_active_currency(
    conn: &mut SqliteConnection,
    code: CurrencyCode,
) -> Result<Currency, RepoError> {
    match fetch_currency(conn, code).await? {
        Some(c) if c.is_active => Ok(c),
        Some(_) => Err(DomainError::Validation(format!("Currency {} is not active", code)).into()),
        None => Err(DomainError::Validation(format!("Unknown currency: {}", code)).into()),
    }
}

async fn fetch_branch(
    conn: &mut SqliteConnection,
    id: BranchId,
) -> Result<Option<Branch>, RepoError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?");
    let row: Option<DbBranch> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbBranch::into_domain).transpose()
}

async fn fetch_rate(conn: &mut SqliteConnection, id: RateId) -> Result<Option<ExchangeRate>, RepoError> {
    let sql = format!("SELECT {RATE_COLUMNS} FROM exchange_rates WHERE id = ?");
    let row: Option<DbRate> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbRate::into_domain).transpose()
}

async fn fetch_active_rate(
    conn: &mut SqliteConnection,
    branch_id: BranchId,
    from: CurrencyCode,
    to: CurrencyCode,
) -> Result<Option<ExchangeRate>, RepoError> {
    let sql = format!(
        "SELECT {RATE_COLUMNS} FROM exchange_rates
         WHERE branch_id = ? AND from_currency = ? AND to_currency = ? AND is_active = 1"
    );
    let row: Option<DbRate> = sqlx::query_as(&sql)
        .bind(branch_id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(DbRate::into_domain).transpose()
}

async fn fetch_order(
    conn: &mut SqliteConnection,
    column: &str,
    value: &str,
) -> Result<Option<Order>, RepoError> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {column} = ?");
    let Some(row): Option<DbOrder> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
    else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM order_items i WHERE i.order_id = ? ORDER BY i.position"
    );
    let items: Vec<DbOrderItem> = sqlx::query_as(&sql)
        .bind(&row.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM order_documents d WHERE d.order_id = ? ORDER BY d.uploaded_at"
    );
    let documents: Vec<DbDocument> = sqlx::query_as(&sql)
        .bind(&row.id)
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
    row.into_domain(items, documents).map(Some)
}

async fn load_roles(conn: &mut SqliteConnection, user_id: &str) -> Result<Vec<String>, RepoError> {
    sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = ? ORDER BY role")
        .bind(user_id)
        .fetch_all(conn)
        .await
        .map_err(db_err)
}

async fn fetch_user(
    conn: &mut SqliteConnection,
    column: &str,
    value: &str,
) -> Result<Option<User>, RepoError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?");
    let row: Option<DbUser> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match row {
        Some(row) => {
            let roles = load_roles(conn, &row.id).await?;
            row.into_domain(roles).map(Some)
        }
        None => Ok(None),
    }
}

pub(crate) async fn insert_notification(
    conn: &mut SqliteConnection,
    notification: &Notification,
) -> Result<(), RepoError> {
    sqlx::query(
        r#"INSERT INTO notifications (id, event_type, payload, status, created_at, available_at, attempts)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(notification.id.to_string())
    .bind(&notification.event_type)
    .bind(notification.payload.to_string())
    .bind(notification.status.to_string())
    .bind(ts(notification.created_at))
    .bind(ts(notification.available_at))
    .bind(notification.attempts)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Writes the balance only if its row still carries `version`.
///
/// A purchase that committed in between has bumped the version, so this one
/// fails with `Conflict` instead of overwriting it.
pub(crate) async fn swap_balance(
    conn: &mut SqliteConnection,
    balance: &CurrencyBalance,
    version: i64,
) -> Result<(), RepoError> {
    let result = sqlx::query(
        r#"UPDATE currency_balances
           SET amount = ?, average_purchase_rate = ?, version = version + 1, updated_at = ?
           WHERE id = ? AND version = ?"#,
    )
    .bind(balance.amount.to_string())
    .bind(balance.average_purchase_rate.to_string())
    .bind(ts(balance.updated_at))
    .bind(balance.id.to_string())
    .bind(version)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(RepoError::Conflict(
            "Balance was modified concurrently".into(),
        ));
    }
    Ok(())
}

/// Writes the order's new status only if the row still holds `expected`.
pub(crate) async fn swap_order_status(
    conn: &mut SqliteConnection,
    order: &Order,
    expected: OrderStatus,
) -> Result<(), RepoError> {
    let result = sqlx::query(
        r#"UPDATE orders SET status = ?, operator_id = ?, updated_at = ? WHERE id = ? AND status = ?"#,
    )
    .bind(order.status.as_str())
    .bind(order.operator_id.map(|u| u.to_string()))
    .bind(ts(order.updated_at))
    .bind(order.id.to_string())
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(RepoError::Conflict(
            "Order status was changed concurrently".into(),
        ));
    }
    Ok(())
}

fn group_by_order<T>(rows: Vec<(String, T)>) -> HashMap<String, Vec<T>> {
    let mut grouped: HashMap<String, Vec<T>> = HashMap::new();
    for (order_id, value) in rows {
        grouped.entry(order_id).or_default().push(value);
    }
    grouped
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl ExchangeRepository for SqliteRepo {
    // ─────────────────────────────────────────────────────────────────────────
    // Currencies
    // ─────────────────────────────────────────────────────────────────────────

    async fn create_currency(&self, req: CreateCurrencyRequest) -> Result<Currency, RepoError> {
        let currency = Currency::new(req.code, req.name, req.symbol, req.decimal_places)?;

        sqlx::query(
            r#"INSERT INTO currencies (code, name, symbol, decimal_places, is_active) VALUES (?, ?, ?, ?, ?)"#,
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
            "SELECT {CURRENCY_COLUMNS} FROM currencies WHERE ? OR is_active = 1 ORDER BY code"
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

        let mut currency = fetch_currency(&mut db_tx, code)
            .await?
            .ok_or(RepoError::NotFound)?;
        currency.apply_update(req)?;

        sqlx::query(
            r#"UPDATE currencies SET name = ?, symbol = ?, decimal_places = ?, is_active = ? WHERE code = ?"#,
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

        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        if fetch_currency(&mut db_tx, branch.base_currency).await?.is_none() {
            return Err(DomainError::Validation(format!(
                "Unknown base currency: {}",
                branch.base_currency
            ))
            .into());
        }
        if let Some(manager) = branch.manager_id {
            if fetch_user(&mut db_tx, "id", &manager.to_string()).await?.is_none() {
                return Err(DomainError::Validation(format!("Unknown manager: {}", manager)).into());
            }
        }

        let working_hours = serde_json::to_string(&branch.working_hours)
            .map_err(|e| RepoError::Database(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO branches (id, name, city, address, phone, email, is_active, base_currency, manager_id, working_hours, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(branch.id.to_string())
        .bind(&branch.name)
        .bind(&branch.city)
        .bind(&branch.address)
        .bind(&branch.phone)
        .bind(&branch.email)
        .bind(branch.is_active)
        .bind(branch.base_currency.as_str())
        .bind(branch.manager_id.map(|m| m.to_string()))
        .bind(working_hours)
        .bind(ts(branch.created_at))
        .bind(ts(branch.updated_at))
        .execute(&mut *db_tx)
        .await
        .map_err(|e| write_err(e, "Branch already exists"))?;

        db_tx.commit().await.map_err(tx_err)?;
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
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(rate.id.to_string())
        .bind(rate.branch_id.to_string())
        .bind(rate.from_currency.as_str())
        .bind(rate.to_currency.as_str())
        .bind(rate.rate.to_string())
        .bind(rate.min_amount.to_string())
        .bind(rate.is_active)
        .bind(ts(rate.updated_at))
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

        let mut rate = fetch_rate(&mut db_tx, id).await?.ok_or(RepoError::NotFound)?;
        rate.update(req.rate, req.min_amount, req.is_active)?;

        sqlx::query(
            r#"UPDATE exchange_rates SET rate = ?, min_amount = ?, is_active = ?, updated_at = ? WHERE id = ?"#,
        )
        .bind(rate.rate.to_string())
        .bind(rate.min_amount.to_string())
        .bind(rate.is_active)
        .bind(ts(rate.updated_at))
        .bind(id.to_string())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(rate)
    }

    async fn get_rate(&self, id: RateId) -> Result<Option<ExchangeRate>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_rate(&mut conn, id).await
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
        let branch = filter.branch_id.map(|b| b.to_string());
        let sql = format!(
            "SELECT {RATE_COLUMNS} FROM exchange_rates
             WHERE (? IS NULL OR branch_id = ?) AND (? OR is_active = 1)
             ORDER BY branch_id, from_currency, to_currency"
        );
        let rows: Vec<DbRate> = sqlx::query_as(&sql)
            .bind(&branch)
            .bind(&branch)
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
            "SELECT {BALANCE_COLUMNS} FROM currency_balances WHERE branch_id = ? ORDER BY currency"
        );
        let rows: Vec<DbBalance> = sqlx::query_as(&sql)
            .bind(branch_id.to_string())
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
            r#"INSERT OR IGNORE INTO currency_balances (id, branch_id, currency, amount, average_purchase_rate, version, updated_at)
               VALUES (?, ?, ?, '0', '0', 0, ?)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(branch_id.to_string())
        .bind(req.currency.as_str())
        .bind(ts(Utc::now()))
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM currency_balances WHERE branch_id = ? AND currency = ?"
        );
        let row: DbBalance = sqlx::query_as(&sql)
            .bind(branch_id.to_string())
            .bind(req.currency.as_str())
            .fetch_one(&mut *db_tx)
            .await
            .map_err(db_err)?;

        let version = row.version;
        let mut balance = row.into_domain()?;
        balance.record_purchase(req.amount, req.rate)?;
        swap_balance(&mut db_tx, &balance, version).await?;

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
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)"#,
        )
        .bind(order.id.to_string())
        .bind(order.tracking_code.as_str())
        .bind(order.user_id.map(|u| u.to_string()))
        .bind(order.branch_id.to_string())
        .bind(order.status.as_str())
        .bind(&order.client_email)
        .bind(&order.client_phone)
        .bind(&order.delivery_address)
        .bind(ts(order.created_at))
        .bind(ts(order.updated_at))
        .execute(&mut *db_tx)
        .await
        .map_err(|e| race_err(e, "Tracking code collision, please retry"))?;

        for item in &order.items {
            sqlx::query(
                r#"INSERT INTO order_items (order_id, position, from_currency, to_currency, from_amount, to_amount, rate)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(order.id.to_string())
            .bind(item.position as i64)
            .bind(item.from_currency.as_str())
            .bind(item.to_currency.as_str())
            .bind(item.from_amount.to_string())
            .bind(item.to_amount.to_string())
            .bind(item.rate.to_string())
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
        fetch_order(&mut conn, "id", &id.to_string()).await
    }

    async fn get_order_by_tracking_code(
        &self,
        code: &TrackingCode,
    ) -> Result<Option<Order>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_order(&mut conn, "tracking_code", code.as_str()).await
    }

    async fn list_orders(&self, scope: OrderScope) -> Result<Vec<Order>, RepoError> {
        let user = match scope {
            OrderScope::All => None,
            OrderScope::User(id) => Some(id.to_string()),
        };
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE (? IS NULL OR user_id = ?)
             ORDER BY created_at DESC"
        );
        let rows: Vec<DbOrder> = sqlx::query_as(&sql)
            .bind(&user)
            .bind(&user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM order_items i JOIN orders o ON o.id = i.order_id
             WHERE (? IS NULL OR o.user_id = ?)
             ORDER BY i.position"
        );
        let items: Vec<DbOrderItem> = sqlx::query_as(&sql)
            .bind(&user)
            .bind(&user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM order_documents d JOIN orders o ON o.id = d.order_id
             WHERE (? IS NULL OR o.user_id = ?)
             ORDER BY d.uploaded_at"
        );
        let documents: Vec<DbDocument> = sqlx::query_as(&sql)
            .bind(&user)
            .bind(&user)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut items = group_by_order(
            items
                .into_iter()
                .map(|row| Ok((row.order_id.clone(), row.into_domain()?)))
                .collect::<Result<Vec<_>, RepoError>>()?,
        );
        let mut documents = group_by_order(
            documents
                .into_iter()
                .map(|row| Ok((row.order_id.clone(), row.into_domain()?)))
                .collect::<Result<Vec<_>, RepoError>>()?,
        );

        rows.into_iter()
            .map(|row| {
                let order_items = items.remove(&row.id).unwrap_or_default();
                let order_documents = documents.remove(&row.id).unwrap_or_default();
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

        let mut order = fetch_order(&mut db_tx, "id", &id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        let previous = order.transition(target)?;
        order.operator_id = operator_id.or(order.operator_id);

        swap_order_status(&mut db_tx, &order, previous).await?;

        insert_notification(&mut db_tx, &Notification::status_changed(&order, previous)).await?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(order)
    }

    async fn delete_order(&self, id: OrderId) -> Result<(), RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = ?")
            .bind(id.to_string())
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

        sqlx::query("DELETE FROM orders WHERE id = ? AND status = 'new'")
            .bind(id.to_string())
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

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM orders WHERE id = ?")
            .bind(order_id.to_string())
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(RepoError::NotFound);
        }

        sqlx::query(
            r#"INSERT INTO order_documents (id, order_id, doc_type, file_handle, uploaded_by, uploaded_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(document.id.to_string())
        .bind(order_id.to_string())
        .bind(document.doc_type.as_str())
        .bind(&document.file_handle)
        .bind(document.uploaded_by.map(|u| u.to_string()))
        .bind(ts(document.uploaded_at))
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

        let order = fetch_order(&mut db_tx, "id", &req.order_id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        let review = Review::new(&order, user_id, req.rating, req.text)?;

        sqlx::query(
            r#"INSERT INTO reviews (id, order_id, user_id, rating, text, is_visible, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(review.id.to_string())
        .bind(review.order_id.to_string())
        .bind(review.user_id.to_string())
        .bind(review.rating as i64)
        .bind(&review.text)
        .bind(review.is_visible)
        .bind(ts(review.created_at))
        .execute(&mut *db_tx)
        .await
        .map_err(|e| write_err(e, "This order already has a review"))?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(review)
    }

    async fn list_reviews(&self, scope: ReviewScope) -> Result<Vec<Review>, RepoError> {
        let (filter, user) = match scope {
            ReviewScope::Public => ("is_visible = 1", None),
            ReviewScope::All => ("1 = 1", None),
            ReviewScope::User(id) => ("user_id = ?", Some(id.to_string())),
        };
        let sql = format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE {filter} ORDER BY created_at DESC"
        );
        let mut query = sqlx::query_as::<_, DbReview>(&sql);
        if let Some(user) = user {
            query = query.bind(user);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        rows.into_iter().map(DbReview::into_domain).collect()
    }

    async fn set_review_visibility(
        &self,
        id: ReviewId,
        is_visible: bool,
    ) -> Result<Review, RepoError> {
        let result = sqlx::query("UPDATE reviews SET is_visible = ? WHERE id = ?")
            .bind(is_visible)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }

        let sql = format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = ?");
        let row: DbReview = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        row.into_domain()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    async fn upsert_identity(&self, identity: Identity) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        if let Some(user) = fetch_user(&mut db_tx, "external_id", &identity.external_id).await? {
            db_tx.commit().await.map_err(tx_err)?;
            return Ok(user);
        }

        let email = identity.email.trim().to_lowercase();
        if let Some(mut user) = fetch_user(&mut db_tx, "email", &email).await? {
            sqlx::query("UPDATE users SET external_id = ? WHERE id = ?")
                .bind(&identity.external_id)
                .bind(user.id.to_string())
                .execute(&mut *db_tx)
                .await
                .map_err(|e| race_err(e, "Identity is already linked"))?;
            db_tx.commit().await.map_err(tx_err)?;
            user.external_id = identity.external_id;
            return Ok(user);
        }

        let user = User::from_identity(&identity)?;
        sqlx::query(
            r#"INSERT INTO users (id, external_id, email, username, first_name, last_name, phone, telegram, referral_code, referred_by, referral_balance, created_at)
               VALUES (?, ?, ?, ?, NULL, NULL, NULL, NULL, ?, NULL, ?, ?)"#,
        )
        .bind(user.id.to_string())
        .bind(&user.external_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.referral_code)
        .bind(user.referral_balance.to_string())
        .bind(ts(user.created_at))
        .execute(&mut *db_tx)
        .await
        .map_err(|e| race_err(e, "User was registered concurrently"))?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepoError> {
        let mut conn = self.conn().await?;
        fetch_user(&mut conn, "id", &id.to_string()).await
    }

    async fn update_profile(
        &self,
        id: UserId,
        req: UpdateProfileRequest,
    ) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut user = fetch_user(&mut db_tx, "id", &id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        user.apply_profile(req)?;

        sqlx::query(
            r#"UPDATE users SET username = ?, first_name = ?, last_name = ?, phone = ?, telegram = ? WHERE id = ?"#,
        )
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(&user.telegram)
        .bind(id.to_string())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        db_tx.commit().await.map_err(tx_err)?;
        Ok(user)
    }

    async fn set_roles(&self, id: UserId, roles: BTreeSet<Role>) -> Result<User, RepoError> {
        let mut db_tx = self.pool.begin().await.map_err(tx_err)?;

        let mut user = fetch_user(&mut db_tx, "id", &id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;

        sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
            .bind(id.to_string())
            .execute(&mut *db_tx)
            .await
            .map_err(db_err)?;

        for role in &roles {
            sqlx::query("INSERT INTO user_roles (user_id, role) VALUES (?, ?)")
                .bind(id.to_string())
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

        let mut user = fetch_user(&mut db_tx, "id", &id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        let referrer = fetch_user(&mut db_tx, "referral_code", referral_code.trim())
            .await?
            .ok_or_else(|| DomainError::Validation("Unknown referral code".into()))?;
        user.apply_referral(&referrer)?;

        let result =
            sqlx::query("UPDATE users SET referred_by = ? WHERE id = ? AND referred_by IS NULL")
                .bind(referrer.id.to_string())
                .bind(id.to_string())
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
            "SELECT {USER_COLUMNS} FROM users WHERE referred_by = ? ORDER BY created_at DESC"
        );
        let rows: Vec<DbUser> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let roles = load_roles(&mut conn, &row.id).await?;
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
        // Expired PROCESSING leases are claimed like due PENDING rows
        let sql = format!(
            "UPDATE notifications SET status = 'PROCESSING', available_at = ?
             WHERE id IN (
                 SELECT id FROM notifications
                 WHERE status IN ('PENDING', 'PROCESSING') AND available_at <= ?
                 ORDER BY created_at ASC LIMIT ?
             )
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let rows: Vec<DbNotification> = sqlx::query_as(&sql)
            .bind(ts(lease_until))
            .bind(ts(Utc::now()))
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
               SET status = ?, processed_at = ?, last_error = ?, available_at = ?,
                   attempts = attempts + 1
               WHERE id = ?"#,
        )
        .bind(status.to_string())
        .bind(ts(Utc::now()))
        .bind(error)
        .bind(ts(retry_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
