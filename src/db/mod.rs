//! Position journal in sqlite.
//!
//! Every open, partial sale and close is appended to `position_events`, so
//! positions still open at shutdown can be listed after a restart. Amounts
//! and prices are stored as decimal strings.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::api::krw_market;
use crate::models::Position;
use crate::trading::ClosedTrade;

const EVENT_OPEN: &str = "open";
const EVENT_PARTIAL: &str = "partial";
const EVENT_CLOSE: &str = "close";

/// Append-only journal of position lifecycle events.
pub struct PositionJournal {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRow {
    id: i64,
    coin: String,
    market: String,
    event: String,
    price: String,
    amount: String,
    cost_basis: String,
    pnl: Option<String>,
    profit_target: Option<String>,
    stop_loss: Option<String>,
    reason: Option<String>,
    order_id: Option<String>,
    recorded_at: DateTime<Utc>,
}

/// A journal row with parsed amounts.
#[derive(Debug, Clone)]
pub struct JournalEvent {
    pub id: i64,
    pub coin: String,
    pub market: String,
    pub event: String,
    /// Entry price for opens, exit price otherwise
    pub price: Decimal,
    pub amount: Decimal,
    pub cost_basis: Decimal,
    pub pnl: Option<Decimal>,
    pub profit_target: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub reason: Option<String>,
    pub order_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

fn parse(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Bad decimal in {}: {}", column, raw))
}

fn parse_opt(column: &str, raw: Option<&str>) -> Result<Option<Decimal>> {
    raw.map(|r| parse(column, r)).transpose()
}

impl TryFrom<EventRow> for JournalEvent {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            price: parse("price", &row.price)?,
            amount: parse("amount", &row.amount)?,
            cost_basis: parse("cost_basis", &row.cost_basis)?,
            pnl: parse_opt("pnl", row.pnl.as_deref())?,
            profit_target: parse_opt("profit_target", row.profit_target.as_deref())?,
            stop_loss: parse_opt("stop_loss", row.stop_loss.as_deref())?,
            id: row.id,
            coin: row.coin,
            market: row.market,
            event: row.event,
            reason: row.reason,
            order_id: row.order_id,
            recorded_at: row.recorded_at,
        })
    }
}

impl PositionJournal {
    /// Connect and create the schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each in-memory connection is its own database
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .context("Failed to connect to journal database")?;

        let journal = Self { pool };
        journal.run_migrations().await?;
        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                coin TEXT NOT NULL,
                market TEXT NOT NULL,
                event TEXT NOT NULL,
                price TEXT NOT NULL,
                amount TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                pnl TEXT,
                profit_target TEXT,
                stop_loss TEXT,
                reason TEXT,
                order_id TEXT,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_position_events_coin ON position_events(coin, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        coin: &str,
        market: &str,
        event: &str,
        price: Decimal,
        amount: Decimal,
        cost_basis: Decimal,
        pnl: Option<Decimal>,
        levels: Option<(Decimal, Decimal)>,
        reason: Option<&str>,
        order_id: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO position_events
                (coin, market, event, price, amount, cost_basis, pnl, profit_target, stop_loss, reason, order_id, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(coin)
        .bind(market)
        .bind(event)
        .bind(price.to_string())
        .bind(amount.to_string())
        .bind(cost_basis.to_string())
        .bind(pnl.map(|p| p.to_string()))
        .bind(levels.map(|(tp, _)| tp.to_string()))
        .bind(levels.map(|(_, sl)| sl.to_string()))
        .bind(reason)
        .bind(order_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to journal {} for {}", event, coin))?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    pub async fn record_open(&self, position: &Position) -> Result<i64> {
        self.insert(
            &position.coin,
            &position.market,
            EVENT_OPEN,
            position.entry_price,
            position.amount,
            position.cost_basis,
            None,
            Some((position.profit_target, position.stop_loss)),
            None,
            position.buy_order_id.as_deref(),
        )
        .await
    }

    /// Record the sold slice of a partial exit.
    pub async fn record_partial(&self, sold: &ClosedTrade) -> Result<i64> {
        self.insert(
            &sold.coin,
            &krw_market(&sold.coin),
            EVENT_PARTIAL,
            sold.exit_price,
            sold.amount,
            sold.cost_basis,
            Some(sold.pnl),
            None,
            None,
            None,
        )
        .await
    }

    pub async fn record_close(&self, closed: &ClosedTrade, reason: &str) -> Result<i64> {
        self.insert(
            &closed.coin,
            &krw_market(&closed.coin),
            EVENT_CLOSE,
            closed.exit_price,
            closed.amount,
            closed.cost_basis,
            Some(closed.pnl),
            None,
            Some(reason),
            None,
        )
        .await
    }

    /// Latest open per coin with no close after it. Amount and cost basis are
    /// net of any partial sales since the open.
    pub async fn open_positions(&self) -> Result<Vec<JournalEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM position_events o
            WHERE o.event = 'open'
              AND NOT EXISTS (
                  SELECT 1 FROM position_events c
                  WHERE c.coin = o.coin AND c.id > o.id AND c.event IN ('open', 'close')
              )
            ORDER BY o.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open positions")?;

        let mut open = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = JournalEvent::try_from(row)?;
            for partial in self.partials_since(&entry.coin, entry.id).await? {
                entry.amount -= partial.amount;
                entry.cost_basis -= partial.cost_basis;
            }
            open.push(entry);
        }
        Ok(open)
    }

    async fn partials_since(&self, coin: &str, after_id: i64) -> Result<Vec<JournalEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM position_events WHERE coin = ? AND id > ? AND event = 'partial' ORDER BY id",
        )
        .bind(coin)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JournalEvent::try_from).collect()
    }

    /// Most recent closes, newest first.
    pub async fn recent_closes(&self, limit: i64) -> Result<Vec<JournalEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM position_events WHERE event = 'close' ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch closes")?;

        rows.into_iter().map(JournalEvent::try_from).collect()
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
