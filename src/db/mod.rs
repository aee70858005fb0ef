//! Persistence: orders, follower links, instruments, accounts and
//! replication events on a single SQLite pool.
//!
//! The order store is the only writer-contended surface: fan-out creates
//! one parent-referencing row per follower concurrently, and status
//! appends race with the reconciler. Appends are optimistic on the
//! `revision` column and refuse non-monotonic transitions.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    CopyPolicy, Exchange, FollowerLink, InstrumentCode, Order, OrderDraft, OrderKind, OrderSide,
    OrderStatus, ProductKind, ReplicationEvent, Validity,
};

/// Errors from the order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested transition would move the order backwards; the caller
    /// rereads and discards its update.
    #[error("stale transition: {current} -> {requested}")]
    StaleTransition { current: String, requested: String },

    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Status append payload. Fill fields are carried when the broker reports
/// execution so position and balance bookkeeping stay current.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<OrderStatus>,
    pub broker_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub message: Option<String>,
    pub filled_quantity: Option<i64>,
    pub average_price: Option<Decimal>,
}

impl StatusUpdate {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_broker_ids(
        status: OrderStatus,
        broker_order_id: Option<String>,
        exchange_order_id: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            status: Some(status),
            broker_order_id,
            exchange_order_id,
            message,
            ..Default::default()
        }
    }
}

/// Broker credentials and balance for one trading account.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub account_id: String,
    /// Base64 AES-GCM blob holding the broker credential JSON.
    pub sealed_credentials: String,
    pub balance: Decimal,
    /// Account-level risk overrides; None falls back to the system default.
    pub max_daily_loss: Option<Decimal>,
    pub max_drawdown_pct: Option<Decimal>,
    pub max_position_notional: Option<Decimal>,
    pub max_open_positions: Option<u32>,
    pub max_exposure: Option<Decimal>,
}

/// One open position row used by the risk gate.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub account_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    /// Signed net quantity; positive = long.
    pub quantity: i64,
    pub last_mark: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct OrderRow {
    id: String,
    owner: String,
    strategy_id: Option<String>,
    parent_id: Option<String>,
    side: String,
    kind: String,
    symbol: String,
    exchange: String,
    quantity: i64,
    limit_price: Option<f64>,
    trigger_price: Option<f64>,
    product: String,
    validity: String,
    status: String,
    broker_order_id: Option<String>,
    exchange_order_id: Option<String>,
    message: Option<String>,
    revision: i64,
    created_at: String,
    submitted_at: Option<String>,
    closed_at: Option<String>,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s}: {e}")))
}

fn decimal_from(value: f64, what: &str) -> Result<Decimal, StoreError> {
    Decimal::try_from(value).map_err(|e| StoreError::Corrupt(format!("bad {what} {value}: {e}")))
}

impl OrderRow {
    fn into_order(self) -> Result<Order, StoreError> {
        let corrupt = |what: &str, value: &str| StoreError::Corrupt(format!("bad {what}: {value}"));
        Ok(Order {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("order id", &self.id))?,
            owner: self.owner,
            strategy_id: self.strategy_id,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|p| Uuid::parse_str(p).map_err(|_| corrupt("parent id", p)))
                .transpose()?,
            side: OrderSide::parse(&self.side).ok_or_else(|| corrupt("side", &self.side))?,
            kind: OrderKind::parse(&self.kind).ok_or_else(|| corrupt("kind", &self.kind))?,
            symbol: self.symbol,
            exchange: Exchange::parse(&self.exchange)
                .ok_or_else(|| corrupt("exchange", &self.exchange))?,
            quantity: self.quantity,
            limit_price: self
                .limit_price
                .map(|p| decimal_from(p, "limit price"))
                .transpose()?,
            trigger_price: self
                .trigger_price
                .map(|p| decimal_from(p, "trigger price"))
                .transpose()?,
            product: ProductKind::parse(&self.product)
                .ok_or_else(|| corrupt("product", &self.product))?,
            validity: Validity::parse(&self.validity)
                .ok_or_else(|| corrupt("validity", &self.validity))?,
            status: OrderStatus::parse(&self.status)
                .ok_or_else(|| corrupt("status", &self.status))?,
            broker_order_id: self.broker_order_id,
            exchange_order_id: self.exchange_order_id,
            message: self.message,
            revision: self.revision,
            created_at: parse_ts(&self.created_at)?,
            submitted_at: self.submitted_at.as_deref().map(parse_ts).transpose()?,
            closed_at: self.closed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LinkRow {
    master: String,
    follower: String,
    strategy: String,
    ratio: Option<f64>,
    percent: Option<f64>,
    fixed_quantity: Option<i64>,
    max_order_notional: Option<f64>,
    max_daily_loss: Option<f64>,
    active: bool,
    created_at: String,
}

impl LinkRow {
    fn into_link(self) -> Result<FollowerLink, StoreError> {
        let policy = match self.strategy.as_str() {
            "FIXED_RATIO" => CopyPolicy::FixedRatio {
                ratio: decimal_from(self.ratio.unwrap_or(1.0), "ratio")?,
            },
            "PERCENTAGE" => CopyPolicy::Percentage {
                percent: decimal_from(self.percent.unwrap_or(10.0), "percent")?,
            },
            "FIXED_QUANTITY" => CopyPolicy::FixedQuantity {
                quantity: self.fixed_quantity.unwrap_or(1),
            },
            other => return Err(StoreError::Corrupt(format!("bad copy strategy: {other}"))),
        };
        Ok(FollowerLink {
            master: self.master,
            follower: self.follower,
            policy,
            max_order_notional: self
                .max_order_notional
                .map(|v| decimal_from(v, "max order notional"))
                .transpose()?,
            max_daily_loss: self
                .max_daily_loss
                .map(|v| decimal_from(v, "max daily loss"))
                .transpose()?,
            active: self.active,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Database handle; cheap to clone, connections pooled.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database URL")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database for tests. Single connection: SQLite gives each
    /// `:memory:` connection its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                strategy_id TEXT,
                parent_id TEXT REFERENCES orders(id),
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                limit_price REAL,
                trigger_price REAL,
                product TEXT NOT NULL,
                validity TEXT NOT NULL,
                status TEXT NOT NULL,
                broker_order_id TEXT,
                exchange_order_id TEXT,
                message TEXT,
                filled_quantity INTEGER NOT NULL DEFAULT 0,
                average_price REAL,
                fees REAL NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                submitted_at TEXT,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_parent ON orders(parent_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_owner ON orders(owner, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_links (
                master TEXT NOT NULL,
                follower TEXT NOT NULL,
                strategy TEXT NOT NULL,
                ratio REAL,
                percent REAL,
                fixed_quantity INTEGER,
                max_order_notional REAL,
                max_daily_loss REAL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                PRIMARY KEY (master, follower)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instrument_codes (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                segment TEXT NOT NULL DEFAULT 'C',
                scrip_code INTEGER NOT NULL,
                lot_size INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, exchange)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                sealed_credentials TEXT NOT NULL,
                balance REAL NOT NULL DEFAULT 0,
                max_daily_loss REAL,
                max_drawdown_pct REAL,
                max_position_notional REAL,
                max_open_positions INTEGER,
                max_exposure REAL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                last_mark REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, symbol, exchange)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_marks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                balance REAL NOT NULL,
                at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                master_order_id TEXT NOT NULL,
                total INTEGER NOT NULL,
                dispatched INTEGER NOT NULL,
                policy_skipped INTEGER NOT NULL,
                unmapped INTEGER NOT NULL,
                risk_denied INTEGER NOT NULL,
                broker_errored INTEGER NOT NULL,
                timed_out INTEGER NOT NULL,
                p50_ms REAL,
                p95_ms REAL,
                p99_ms REAL,
                detail TEXT NOT NULL,
                started_at TEXT NOT NULL,
                sealed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- Order store -------------------------------------------------

    /// Persist a new order in Pending state.
    pub async fn create_order(&self, draft: &OrderDraft) -> Result<Order, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, owner, strategy_id, parent_id, side, kind, symbol, exchange,
                quantity, limit_price, trigger_price, product, validity, status,
                revision, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&draft.owner)
        .bind(&draft.strategy_id)
        .bind(draft.parent_id.map(|p| p.to_string()))
        .bind(draft.side.as_str())
        .bind(draft.kind.as_str())
        .bind(&draft.symbol)
        .bind(draft.exchange.as_str())
        .bind(draft.quantity)
        .bind(draft.limit_price.and_then(|p| p.to_f64()))
        .bind(draft.trigger_price.and_then(|p| p.to_f64()))
        .bind(draft.product.as_str())
        .bind(draft.validity.as_str())
        .bind(OrderStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_order(id).await
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Order, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as("SELECT * FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound(id))?.into_order()
    }

    /// Append a status transition, optimistic on `revision`.
    ///
    /// Returns `StaleTransition` when the requested move is backwards; the
    /// caller rereads and discards. Concurrent revision bumps are retried
    /// internally against the fresh row.
    pub async fn append_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<Order, StoreError> {
        loop {
            let current = self.get_order(id).await?;
            if let Some(next) = update.status {
                if !current.status.can_transition_to(next) {
                    return Err(StoreError::StaleTransition {
                        current: current.status.as_str().to_string(),
                        requested: next.as_str().to_string(),
                    });
                }
            }

            let now = Utc::now();
            let next_status = update.status.unwrap_or(current.status);
            let submitted_at = if next_status == OrderStatus::Submitted
                && current.submitted_at.is_none()
            {
                Some(now)
            } else {
                current.submitted_at
            };
            let closed_at = if next_status.is_terminal() && current.closed_at.is_none() {
                Some(now)
            } else {
                current.closed_at
            };

            let changed = sqlx::query(
                r#"
                UPDATE orders SET
                    status = ?,
                    broker_order_id = COALESCE(?, broker_order_id),
                    exchange_order_id = COALESCE(?, exchange_order_id),
                    message = COALESCE(?, message),
                    filled_quantity = COALESCE(?, filled_quantity),
                    average_price = COALESCE(?, average_price),
                    submitted_at = ?,
                    closed_at = ?,
                    revision = revision + 1
                WHERE id = ? AND revision = ?
                "#,
            )
            .bind(next_status.as_str())
            .bind(&update.broker_order_id)
            .bind(&update.exchange_order_id)
            .bind(&update.message)
            .bind(update.filled_quantity)
            .bind(update.average_price.and_then(|p| p.to_f64()))
            .bind(submitted_at.map(|t| t.to_rfc3339()))
            .bind(closed_at.map(|t| t.to_rfc3339()))
            .bind(id.to_string())
            .bind(current.revision)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if changed == 1 {
                if matches!(
                    next_status,
                    OrderStatus::Filled | OrderStatus::PartiallyFilled
                ) {
                    if let (Some(qty), Some(price)) =
                        (update.filled_quantity, update.average_price)
                    {
                        self.apply_fill(&current, qty, price).await?;
                    }
                }
                return self.get_order(id).await;
            }
            // Lost the revision race; reread and retry.
        }
    }

    /// Fold an execution into positions and the balance series.
    async fn apply_fill(
        &self,
        order: &Order,
        filled_quantity: i64,
        average_price: Decimal,
    ) -> Result<(), StoreError> {
        let signed = match order.side {
            OrderSide::Buy => filled_quantity,
            OrderSide::Sell => -filled_quantity,
        };
        let mark = average_price.to_f64().unwrap_or(0.0);
        let notional = mark * filled_quantity as f64;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO positions (account_id, symbol, exchange, quantity, last_mark, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, symbol, exchange) DO UPDATE SET
                quantity = quantity + excluded.quantity,
                last_mark = excluded.last_mark,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&order.owner)
        .bind(&order.symbol)
        .bind(order.exchange.as_str())
        .bind(signed)
        .bind(mark)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let delta = match order.side {
            OrderSide::Buy => -notional,
            OrderSide::Sell => notional,
        };
        sqlx::query("UPDATE accounts SET balance = balance + ? WHERE account_id = ?")
            .bind(delta)
            .bind(&order.owner)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO balance_marks (account_id, balance, at)
             SELECT account_id, balance, ? FROM accounts WHERE account_id = ?",
        )
        .bind(&now)
        .bind(&order.owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_by_parent(&self, parent: Uuid) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> =
            sqlx::query_as("SELECT * FROM orders WHERE parent_id = ? ORDER BY created_at")
                .bind(parent.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    /// The follower order already derived from `parent` for `owner`, if any.
    /// Lets a re-dispatched master order short-circuit instead of placing twice.
    pub async fn find_follower_order(
        &self,
        parent: Uuid,
        owner: &str,
    ) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as("SELECT * FROM orders WHERE parent_id = ? AND owner = ?")
                .bind(parent.to_string())
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?;
        row.map(OrderRow::into_order).transpose()
    }

    /// Orders stuck in Unknown, oldest first, for the reconciler.
    pub async fn list_unknown_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT * FROM orders WHERE status = 'UNKNOWN' ORDER BY created_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    // ---- Follower registry -------------------------------------------

    /// Point-in-time snapshot of active links for a master.
    pub async fn active_followers(&self, master: &str) -> Result<Vec<FollowerLink>, StoreError> {
        let rows: Vec<LinkRow> = sqlx::query_as(
            "SELECT * FROM follower_links WHERE master = ? AND active = 1 ORDER BY follower",
        )
        .bind(master)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LinkRow::into_link).collect()
    }

    /// Create or replace a link. Link CRUD is served by the adjacent
    /// control plane; the engine only writes here from tooling and tests.
    pub async fn save_link(&self, link: &FollowerLink) -> Result<(), StoreError> {
        let (strategy, ratio, percent, fixed_quantity) = match &link.policy {
            CopyPolicy::FixedRatio { ratio } => ("FIXED_RATIO", ratio.to_f64(), None, None),
            CopyPolicy::Percentage { percent } => ("PERCENTAGE", None, percent.to_f64(), None),
            CopyPolicy::FixedQuantity { quantity } => {
                ("FIXED_QUANTITY", None, None, Some(*quantity))
            }
        };
        sqlx::query(
            r#"
            INSERT INTO follower_links (
                master, follower, strategy, ratio, percent, fixed_quantity,
                max_order_notional, max_daily_loss, active, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(master, follower) DO UPDATE SET
                strategy = excluded.strategy,
                ratio = excluded.ratio,
                percent = excluded.percent,
                fixed_quantity = excluded.fixed_quantity,
                max_order_notional = excluded.max_order_notional,
                max_daily_loss = excluded.max_daily_loss,
                active = excluded.active
            "#,
        )
        .bind(&link.master)
        .bind(&link.follower)
        .bind(strategy)
        .bind(ratio)
        .bind(percent)
        .bind(fixed_quantity)
        .bind(link.max_order_notional.and_then(|v| v.to_f64()))
        .bind(link.max_daily_loss.and_then(|v| v.to_f64()))
        .bind(link.active)
        .bind(link.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Instruments -------------------------------------------------

    pub async fn get_instrument(
        &self,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Option<InstrumentCode>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            symbol: String,
            exchange: String,
            segment: String,
            scrip_code: i64,
            lot_size: i64,
            active: bool,
            updated_at: String,
        }
        let row: Option<Row> = sqlx::query_as(
            "SELECT * FROM instrument_codes WHERE symbol = ? AND exchange = ? AND active = 1",
        )
        .bind(symbol)
        .bind(exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(InstrumentCode {
                symbol: r.symbol,
                exchange: Exchange::parse(&r.exchange)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad exchange: {}", r.exchange)))?,
                segment: r.segment,
                scrip_code: r.scrip_code,
                lot_size: r.lot_size,
                active: r.active,
                updated_at: parse_ts(&r.updated_at)?,
            })
        })
        .transpose()
    }

    pub async fn list_active_instruments(&self) -> Result<Vec<InstrumentCode>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            symbol: String,
            exchange: String,
            segment: String,
            scrip_code: i64,
            lot_size: i64,
            active: bool,
            updated_at: String,
        }
        let rows: Vec<Row> = sqlx::query_as("SELECT * FROM instrument_codes WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(InstrumentCode {
                    symbol: r.symbol,
                    exchange: Exchange::parse(&r.exchange).ok_or_else(|| {
                        StoreError::Corrupt(format!("bad exchange: {}", r.exchange))
                    })?,
                    segment: r.segment,
                    scrip_code: r.scrip_code,
                    lot_size: r.lot_size,
                    active: r.active,
                    updated_at: parse_ts(&r.updated_at)?,
                })
            })
            .collect()
    }

    pub async fn save_instrument(&self, code: &InstrumentCode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instrument_codes (symbol, exchange, segment, scrip_code, lot_size, active, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol, exchange) DO UPDATE SET
                segment = excluded.segment,
                scrip_code = excluded.scrip_code,
                lot_size = excluded.lot_size,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&code.symbol)
        .bind(code.exchange.as_str())
        .bind(&code.segment)
        .bind(code.scrip_code)
        .bind(code.lot_size)
        .bind(code.active)
        .bind(code.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Accounts and risk inputs ------------------------------------

    pub async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            account_id: String,
            sealed_credentials: String,
            balance: f64,
            max_daily_loss: Option<f64>,
            max_drawdown_pct: Option<f64>,
            max_position_notional: Option<f64>,
            max_open_positions: Option<i64>,
            max_exposure: Option<f64>,
        }
        let row: Option<Row> = sqlx::query_as("SELECT * FROM accounts WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(AccountRecord {
                account_id: r.account_id,
                sealed_credentials: r.sealed_credentials,
                balance: decimal_from(r.balance, "balance")?,
                max_daily_loss: r
                    .max_daily_loss
                    .map(|v| decimal_from(v, "max daily loss"))
                    .transpose()?,
                max_drawdown_pct: r
                    .max_drawdown_pct
                    .map(|v| decimal_from(v, "max drawdown"))
                    .transpose()?,
                max_position_notional: r
                    .max_position_notional
                    .map(|v| decimal_from(v, "max position notional"))
                    .transpose()?,
                max_open_positions: r.max_open_positions.map(|v| v as u32),
                max_exposure: r
                    .max_exposure
                    .map(|v| decimal_from(v, "max exposure"))
                    .transpose()?,
            })
        })
        .transpose()
    }

    pub async fn save_account(&self, account: &AccountRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                account_id, sealed_credentials, balance, max_daily_loss,
                max_drawdown_pct, max_position_notional, max_open_positions,
                max_exposure, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                sealed_credentials = excluded.sealed_credentials,
                balance = excluded.balance,
                max_daily_loss = excluded.max_daily_loss,
                max_drawdown_pct = excluded.max_drawdown_pct,
                max_position_notional = excluded.max_position_notional,
                max_open_positions = excluded.max_open_positions,
                max_exposure = excluded.max_exposure
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.sealed_credentials)
        .bind(account.balance.to_f64())
        .bind(account.max_daily_loss.and_then(|v| v.to_f64()))
        .bind(account.max_drawdown_pct.and_then(|v| v.to_f64()))
        .bind(account.max_position_notional.and_then(|v| v.to_f64()))
        .bind(account.max_open_positions.map(|v| v as i64))
        .bind(account.max_exposure.and_then(|v| v.to_f64()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Realized PnL from today's executed trades for one account:
    /// sell notional minus buy notional minus fees.
    pub async fn daily_realized_pnl(&self, account_id: &str) -> Result<Decimal, StoreError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        #[derive(sqlx::FromRow)]
        struct Row {
            pnl: Option<f64>,
        }
        let row: Row = sqlx::query_as(
            r#"
            SELECT SUM(
                CASE side WHEN 'SELL' THEN filled_quantity * COALESCE(average_price, 0)
                          ELSE -(filled_quantity * COALESCE(average_price, 0)) END
                - fees
            ) AS pnl
            FROM orders
            WHERE owner = ?
              AND status IN ('FILLED', 'PARTIALLY_FILLED')
              AND created_at >= ?
            "#,
        )
        .bind(account_id)
        .bind(midnight.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        decimal_from(row.pnl.unwrap_or(0.0), "daily pnl")
    }

    pub async fn open_positions(
        &self,
        account_id: &str,
    ) -> Result<Vec<PositionRecord>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            account_id: String,
            symbol: String,
            exchange: String,
            quantity: i64,
            last_mark: f64,
        }
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT account_id, symbol, exchange, quantity, last_mark
             FROM positions WHERE account_id = ? AND quantity != 0",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(PositionRecord {
                    account_id: r.account_id,
                    symbol: r.symbol,
                    exchange: Exchange::parse(&r.exchange).ok_or_else(|| {
                        StoreError::Corrupt(format!("bad exchange: {}", r.exchange))
                    })?,
                    quantity: r.quantity,
                    last_mark: decimal_from(r.last_mark, "mark")?,
                })
            })
            .collect()
    }

    /// Today's balance series for the drawdown estimate, oldest first.
    pub async fn balance_series(&self, account_id: &str) -> Result<Vec<Decimal>, StoreError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        #[derive(sqlx::FromRow)]
        struct Row {
            balance: f64,
        }
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT balance FROM balance_marks WHERE account_id = ? AND at >= ? ORDER BY id",
        )
        .bind(account_id)
        .bind(midnight.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decimal_from(r.balance, "balance"))
            .collect()
    }

    /// Mark-to-market price for a symbol: the latest position mark any
    /// account has seen for it. None until something traded.
    pub async fn last_mark(
        &self,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<Option<Decimal>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            last_mark: f64,
        }
        let row: Option<Row> = sqlx::query_as(
            "SELECT last_mark FROM positions
             WHERE symbol = ? AND exchange = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(symbol)
        .bind(exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decimal_from(r.last_mark, "mark")).transpose()
    }

    // ---- Replication events ------------------------------------------

    /// Append a sealed replication event. Never updated afterwards.
    pub async fn insert_replication_event(
        &self,
        event: &ReplicationEvent,
        p50_ms: Option<f64>,
        p95_ms: Option<f64>,
        p99_ms: Option<f64>,
    ) -> Result<(), StoreError> {
        let detail = serde_json::to_string(&event.records)
            .map_err(|e| StoreError::Corrupt(format!("event detail: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO replication_events (
                master_order_id, total, dispatched, policy_skipped, unmapped,
                risk_denied, broker_errored, timed_out, p50_ms, p95_ms, p99_ms,
                detail, started_at, sealed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.master_order_id.to_string())
        .bind(event.total as i64)
        .bind(event.dispatched as i64)
        .bind(event.policy_skipped as i64)
        .bind(event.unmapped as i64)
        .bind(event.risk_denied as i64)
        .bind(event.broker_errored as i64)
        .bind(event.timed_out as i64)
        .bind(p50_ms)
        .bind(p95_ms)
        .bind(p99_ms)
        .bind(detail)
        .bind(event.started_at.to_rfc3339())
        .bind(event.sealed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Read-through snapshot cache over `Database::active_followers`.
///
/// One snapshot is read per fan-out; a short TTL absorbs bursts of master
/// orders without re-querying, and late link changes within one fan-out are
/// deliberately ignored.
#[derive(Clone)]
pub struct FollowerRegistry {
    db: Database,
    ttl: Duration,
    cache: Arc<RwLock<ahash::AHashMap<String, (Instant, Arc<Vec<FollowerLink>>)>>>,
}

impl FollowerRegistry {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cache: Arc::new(RwLock::new(ahash::AHashMap::new())),
        }
    }

    pub async fn active_followers(&self, master: &str) -> Result<Arc<Vec<FollowerLink>>, StoreError> {
        if self.ttl > Duration::ZERO {
            let cache = self.cache.read().await;
            if let Some((at, snapshot)) = cache.get(master) {
                if at.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = Arc::new(self.db.active_followers(master).await?);
        if self.ttl > Duration::ZERO {
            let mut cache = self.cache.write().await;
            cache.insert(master.to_string(), (Instant::now(), snapshot.clone()));
        }
        Ok(snapshot)
    }
}
