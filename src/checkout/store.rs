//! SQLite-backed order store.
//!
//! Tables:
//! - `orders`: the single active order per buyer; `user_key` is the primary
//!   key, so one-active-order-per-buyer holds at the schema level
//! - `settled_orders`: append-only terminal records; doubles as the sales
//!   counter
//!
//! Every mutation is keyed by `order_id`, not `user_key`: a stale caller
//! holding a replaced order gets [`StoreError::NotFound`] instead of
//! touching the newer session.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The targeted row no longer exists. Callers treat this as a benign
    /// race: another completion already finalized or replaced the order.
    #[error("order not found")]
    NotFound,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Lifecycle state of a persisted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Intent created, waiting for the buyer to pay.
    Pending,
    /// Gateway confirmed settlement.
    Settled,
}

impl OrderStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "settled" => Self::Settled,
            _ => Self::Pending,
        }
    }
}

/// The persisted record linking a buyer to one in-flight payment intent.
#[derive(Debug, Clone)]
pub struct Order {
    /// Gateway order id; the session identity.
    pub order_id: String,
    /// Buyer's chat id.
    pub user_key: String,
    /// Gateway charge id used for status polling.
    pub charge_ref: String,
    /// Buyer display name captured at creation.
    pub buyer_label: String,
    pub status: OrderStatus,
    /// Remarketing stage counter; 0 is the initial offer.
    pub stage: u32,
    /// Epoch seconds at intent creation.
    pub created_at: i64,
}

pub struct OrderStore {
    conn: Mutex<Connection>,
}

impl OrderStore {
    /// Open (or create) the order database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                user_key TEXT PRIMARY KEY,
                order_id TEXT NOT NULL UNIQUE,
                charge_ref TEXT NOT NULL,
                buyer_label TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                stage INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settled_orders (
                order_id TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                buyer_label TEXT NOT NULL,
                stage INTEGER NOT NULL,
                settled_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settled_user ON settled_orders(user_key);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The active order for a buyer, if any.
    pub fn find_active(&self, user_key: &str) -> Result<Option<Order>, StoreError> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT order_id, user_key, charge_ref, buyer_label, status, stage, created_at
             FROM orders WHERE user_key = ?1",
            params![user_key],
            |row| {
                let status: String = row.get(4)?;
                Ok(Order {
                    order_id: row.get(0)?,
                    user_key: row.get(1)?,
                    charge_ref: row.get(2)?,
                    buyer_label: row.get(3)?,
                    status: OrderStatus::from_str(&status),
                    stage: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        );
        match result {
            Ok(order) => Ok(Some(order)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Install `order` as the buyer's active order, destructively replacing
    /// any existing row for the same `user_key` in one transaction.
    pub fn replace(&self, order: &Order) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM orders WHERE user_key = ?1", params![order.user_key])?;
        tx.execute(
            "INSERT INTO orders (user_key, order_id, charge_ref, buyer_label, status, stage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                order.user_key,
                order.order_id,
                order.charge_ref,
                order.buyer_label,
                order.status.as_str(),
                order.stage,
                order.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Bump the remarketing stage of an order.
    pub fn advance_stage(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orders SET stage = stage + 1 WHERE order_id = ?1",
            params![order_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Transition an order to settled.
    pub fn mark_settled(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orders SET status = 'settled' WHERE order_id = ?1",
            params![order_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Remove an order row.
    pub fn delete(&self, order_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM orders WHERE order_id = ?1", params![order_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Append the terminal record of a settled order. Idempotent on
    /// `order_id`, so a double finalize cannot inflate the sales count.
    pub fn record_sale(&self, order: &Order, settled_at: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO settled_orders (order_id, user_key, buyer_label, stage, settled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                order.order_id,
                order.user_key,
                order.buyer_label,
                order.stage,
                settled_at,
            ],
        )?;
        Ok(())
    }

    /// Number of completed sales.
    pub fn completed_sales(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM settled_orders", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
