//! Persistence layer.
//!
//! SQLite ledger holding every trade (open and closed), one derived
//! performance row per UTC day, and a small key/value store for state that
//! must survive restarts. Timestamps are stored as RFC 3339 UTC strings with
//! millisecond precision so the exit date is the first ten characters.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    AllTimeStats, DailyAggregate, ExitReason, LevelMode, Position, SubScores, TradeError,
    TradeRecord,
};

const STATUS_OPEN: &str = "OPEN";
const STATUS_CLOSED: &str = "CLOSED";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        position_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        status TEXT NOT NULL,
        entry_price REAL NOT NULL,
        quantity REAL NOT NULL,
        entry_time TEXT NOT NULL,
        stop_loss REAL NOT NULL,
        take_profit REAL NOT NULL,
        high_water_mark REAL NOT NULL,
        trailing_active INTEGER NOT NULL DEFAULT 0,
        level_mode TEXT NOT NULL,
        entry_score REAL NOT NULL,
        volatility_score REAL NOT NULL,
        volume_score REAL NOT NULL,
        momentum_score REAL NOT NULL,
        technical_score REAL NOT NULL,
        risk_score REAL NOT NULL,
        exit_price REAL,
        exit_time TEXT,
        exit_reason TEXT,
        profit_percent REAL,
        profit_usd REAL,
        duration_seconds INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
    "CREATE INDEX IF NOT EXISTS idx_trades_exit_time ON trades(exit_time)",
    r#"CREATE TABLE IF NOT EXISTS daily_performance (
        date TEXT PRIMARY KEY,
        total_trades INTEGER NOT NULL,
        winning_trades INTEGER NOT NULL,
        losing_trades INTEGER NOT NULL,
        total_profit_usd REAL NOT NULL,
        total_profit_percent REAL NOT NULL,
        win_rate REAL NOT NULL,
        best_trade_percent REAL NOT NULL,
        worst_trade_percent REAL NOT NULL,
        avg_duration_seconds INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS system_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
];

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, TradeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TradeError::Persistence(format!("bad timestamp {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One row of the `trades` table.
#[derive(Debug, Clone, FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub position_id: String,
    pub symbol: String,
    pub status: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: String,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub high_water_mark: f64,
    pub trailing_active: bool,
    pub level_mode: String,
    pub entry_score: f64,
    pub volatility_score: f64,
    pub volume_score: f64,
    pub momentum_score: f64,
    pub technical_score: f64,
    pub risk_score: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub exit_reason: Option<String>,
    pub profit_percent: Option<f64>,
    pub profit_usd: Option<f64>,
    pub duration_seconds: Option<i64>,
}

impl TradeRow {
    pub fn is_open(&self) -> bool {
        self.status == STATUS_OPEN
    }

    pub fn to_position(&self) -> Result<Position, TradeError> {
        let id = Uuid::parse_str(&self.position_id)
            .map_err(|e| TradeError::Persistence(format!("bad position id: {e}")))?;
        Ok(Position {
            id,
            trade_id: Some(self.id),
            symbol: self.symbol.clone(),
            entry_price: self.entry_price,
            quantity: self.quantity,
            entry_time: parse_ts(&self.entry_time)?,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            high_water_mark: self.high_water_mark,
            trailing_active: self.trailing_active,
            level_mode: LevelMode::from_str(&self.level_mode)?,
            entry_score: self.entry_score,
            sub_scores: SubScores {
                volatility: self.volatility_score,
                volume: self.volume_score,
                momentum: self.momentum_score,
                technical: self.technical_score,
                risk: self.risk_score,
            },
        })
    }

    /// The archived record, if this row is closed.
    pub fn to_record(&self) -> Result<Option<TradeRecord>, TradeError> {
        let (Some(exit_price), Some(exit_time), Some(reason)) =
            (self.exit_price, self.exit_time.as_deref(), self.exit_reason.as_deref())
        else {
            return Ok(None);
        };
        Ok(Some(TradeRecord {
            position: self.to_position()?,
            exit_price,
            exit_time: parse_ts(exit_time)?,
            exit_reason: ExitReason::from_str(reason)?,
            profit_percent: self.profit_percent.unwrap_or(0.0),
            profit_usd: self.profit_usd.unwrap_or(0.0),
            duration_seconds: self.duration_seconds.unwrap_or(0),
        }))
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (or create) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, TradeError> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        info!(url, "Ledger ready");
        Ok(ledger)
    }

    /// Private in-memory database. One connection that never expires, so
    /// the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self, TradeError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Create any missing tables and indexes.
    pub async fn migrate(&self) -> Result<(), TradeError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection. Later calls fail with a persistence error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Record a new open position. Returns the row id.
    pub async fn open_trade(&self, pos: &Position) -> Result<i64, TradeError> {
        let res = sqlx::query(
            r#"INSERT INTO trades (
                position_id, symbol, status, entry_price, quantity, entry_time,
                stop_loss, take_profit, high_water_mark, trailing_active, level_mode,
                entry_score, volatility_score, volume_score, momentum_score,
                technical_score, risk_score
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(pos.id.to_string())
        .bind(&pos.symbol)
        .bind(STATUS_OPEN)
        .bind(pos.entry_price)
        .bind(pos.quantity)
        .bind(ts(pos.entry_time))
        .bind(pos.stop_loss)
        .bind(pos.take_profit)
        .bind(pos.high_water_mark)
        .bind(pos.trailing_active)
        .bind(pos.level_mode.to_string())
        .bind(pos.entry_score)
        .bind(pos.sub_scores.volatility)
        .bind(pos.sub_scores.volume)
        .bind(pos.sub_scores.momentum)
        .bind(pos.sub_scores.technical)
        .bind(pos.sub_scores.risk)
        .execute(&self.pool)
        .await?;
        let id = res.last_insert_rowid();
        debug!(trade_id = id, symbol = %pos.symbol, "Open trade recorded");
        Ok(id)
    }

    /// Persist trailing-stop state for an open trade.
    pub async fn update_levels(
        &self,
        trade_id: i64,
        stop_loss: f64,
        high_water_mark: f64,
        trailing_active: bool,
    ) -> Result<(), TradeError> {
        sqlx::query(
            "UPDATE trades SET stop_loss = ?, high_water_mark = ?, trailing_active = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(stop_loss)
        .bind(high_water_mark)
        .bind(trailing_active)
        .bind(trade_id)
        .bind(STATUS_OPEN)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Archive a closed trade and refresh that day's aggregate in one
    /// transaction. Updates the open row when there is one, otherwise
    /// inserts a complete closed row. Closing the same position twice keeps
    /// one row. Returns the row id.
    pub async fn close_trade(&self, rec: &TradeRecord) -> Result<i64, TradeError> {
        let pos = &rec.position;
        let mut tx = self.pool.begin().await?;

        let mut updated = None;
        if let Some(id) = pos.trade_id {
            let res = sqlx::query(
                r#"UPDATE trades SET
                    status = ?, stop_loss = ?, high_water_mark = ?, trailing_active = ?,
                    exit_price = ?, exit_time = ?, exit_reason = ?,
                    profit_percent = ?, profit_usd = ?, duration_seconds = ?
                WHERE id = ? AND status = ?"#,
            )
            .bind(STATUS_CLOSED)
            .bind(pos.stop_loss)
            .bind(pos.high_water_mark)
            .bind(pos.trailing_active)
            .bind(rec.exit_price)
            .bind(ts(rec.exit_time))
            .bind(rec.exit_reason.as_str())
            .bind(rec.profit_percent)
            .bind(rec.profit_usd)
            .bind(rec.duration_seconds)
            .bind(id)
            .bind(STATUS_OPEN)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 1 {
                updated = Some(id);
            }
        }

        // A replayed close whose row was already archived is a no-op.
        if updated.is_none() {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM trades WHERE position_id = ? AND status = ?")
                    .bind(pos.id.to_string())
                    .bind(STATUS_CLOSED)
                    .fetch_optional(&mut *tx)
                    .await?;
            updated = existing.map(|(id,)| id);
        }

        let id = match updated {
            Some(id) => id,
            None => {
                let res = sqlx::query(
                    r#"INSERT INTO trades (
                        position_id, symbol, status, entry_price, quantity, entry_time,
                        stop_loss, take_profit, high_water_mark, trailing_active, level_mode,
                        entry_score, volatility_score, volume_score, momentum_score,
                        technical_score, risk_score, exit_price, exit_time, exit_reason,
                        profit_percent, profit_usd, duration_seconds
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(pos.id.to_string())
                .bind(&pos.symbol)
                .bind(STATUS_CLOSED)
                .bind(pos.entry_price)
                .bind(pos.quantity)
                .bind(ts(pos.entry_time))
                .bind(pos.stop_loss)
                .bind(pos.take_profit)
                .bind(pos.high_water_mark)
                .bind(pos.trailing_active)
                .bind(pos.level_mode.to_string())
                .bind(pos.entry_score)
                .bind(pos.sub_scores.volatility)
                .bind(pos.sub_scores.volume)
                .bind(pos.sub_scores.momentum)
                .bind(pos.sub_scores.technical)
                .bind(pos.sub_scores.risk)
                .bind(rec.exit_price)
                .bind(ts(rec.exit_time))
                .bind(rec.exit_reason.as_str())
                .bind(rec.profit_percent)
                .bind(rec.profit_usd)
                .bind(rec.duration_seconds)
                .execute(&mut *tx)
                .await?;
                res.last_insert_rowid()
            }
        };

        let date = rec.exit_time.date_naive();
        let agg = Self::compute_daily(&mut *tx, date).await?;
        sqlx::query(
            r#"INSERT INTO daily_performance (
                date, total_trades, winning_trades, losing_trades, total_profit_usd,
                total_profit_percent, win_rate, best_trade_percent, worst_trade_percent,
                avg_duration_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                total_trades = excluded.total_trades,
                winning_trades = excluded.winning_trades,
                losing_trades = excluded.losing_trades,
                total_profit_usd = excluded.total_profit_usd,
                total_profit_percent = excluded.total_profit_percent,
                win_rate = excluded.win_rate,
                best_trade_percent = excluded.best_trade_percent,
                worst_trade_percent = excluded.worst_trade_percent,
                avg_duration_seconds = excluded.avg_duration_seconds"#,
        )
        .bind(date.to_string())
        .bind(agg.total_trades as i64)
        .bind(agg.winning_trades as i64)
        .bind(agg.losing_trades as i64)
        .bind(agg.total_profit_usd)
        .bind(agg.total_profit_percent)
        .bind(agg.win_rate)
        .bind(agg.best_trade_percent)
        .bind(agg.worst_trade_percent)
        .bind(agg.avg_duration_seconds)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(trade_id = id, date = %date, "Closed trade recorded");
        Ok(id)
    }

    async fn compute_daily(
        conn: &mut sqlx::SqliteConnection,
        date: NaiveDate,
    ) -> Result<DailyAggregate, TradeError> {
        let row: (i64, i64, i64, f64, f64, f64, f64, f64) = sqlx::query_as(
            r#"SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN profit_percent > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN profit_percent < 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(profit_usd), 0.0),
                COALESCE(SUM(profit_percent), 0.0),
                COALESCE(MAX(profit_percent), 0.0),
                COALESCE(MIN(profit_percent), 0.0),
                COALESCE(AVG(duration_seconds), 0.0)
            FROM trades
            WHERE status = ? AND substr(exit_time, 1, 10) = ?"#,
        )
        .bind(STATUS_CLOSED)
        .bind(date.to_string())
        .fetch_one(&mut *conn)
        .await?;

        let (total, wins, losses, usd, pct, best, worst, avg_dur) = row;
        let win_rate = if total > 0 {
            wins as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(DailyAggregate {
            date,
            total_trades: total as u32,
            winning_trades: wins as u32,
            losing_trades: losses as u32,
            total_profit_usd: usd,
            total_profit_percent: pct,
            win_rate,
            best_trade_percent: best,
            worst_trade_percent: worst,
            avg_duration_seconds: avg_dur.round() as i64,
        })
    }

    /// The single OPEN trade, if any, restored as a position.
    pub async fn load_open_trade(&self) -> Result<Option<Position>, TradeError> {
        let row: Option<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE status = ? ORDER BY id DESC LIMIT 1")
                .bind(STATUS_OPEN)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| r.to_position()).transpose()
    }

    /// Performance for `date`, zeroed when no trade closed that day.
    pub async fn daily_aggregate(&self, date: NaiveDate) -> Result<DailyAggregate, TradeError> {
        let row: Option<(i64, i64, i64, f64, f64, f64, f64, f64, i64)> = sqlx::query_as(
            r#"SELECT total_trades, winning_trades, losing_trades, total_profit_usd,
                total_profit_percent, win_rate, best_trade_percent, worst_trade_percent,
                avg_duration_seconds
            FROM daily_performance WHERE date = ?"#,
        )
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => DailyAggregate::empty(date),
            Some((total, wins, losses, usd, pct, rate, best, worst, dur)) => DailyAggregate {
                date,
                total_trades: total as u32,
                winning_trades: wins as u32,
                losing_trades: losses as u32,
                total_profit_usd: usd,
                total_profit_percent: pct,
                win_rate: rate,
                best_trade_percent: best,
                worst_trade_percent: worst,
                avg_duration_seconds: dur,
            },
        })
    }

    /// Most recent trades, newest first.
    pub async fn recent_trades(&self, limit: u32) -> Result<Vec<TradeRow>, TradeError> {
        let rows = sqlx::query_as("SELECT * FROM trades ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn all_time_stats(&self) -> Result<AllTimeStats, TradeError> {
        let (total, wins, usd, avg, best, worst): (i64, i64, f64, f64, f64, f64) =
            sqlx::query_as(
                r#"SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN profit_percent > 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(profit_usd), 0.0),
                    COALESCE(AVG(profit_percent), 0.0),
                    COALESCE(MAX(profit_percent), 0.0),
                    COALESCE(MIN(profit_percent), 0.0)
                FROM trades WHERE status = ?"#,
            )
            .bind(STATUS_CLOSED)
            .fetch_one(&self.pool)
            .await?;
        Ok(AllTimeStats {
            total_trades: total as u32,
            winning_trades: wins as u32,
            total_profit_usd: usd,
            avg_profit_percent: avg,
            win_rate: if total > 0 {
                wins as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            best_trade_percent: best,
            worst_trade_percent: worst,
        })
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn set_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), TradeError> {
        let json = serde_json::to_string(value)
            .map_err(|e| TradeError::Persistence(format!("serialise {key}: {e}")))?;
        sqlx::query(
            "INSERT INTO system_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(json)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TradeError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM system_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| TradeError::Persistence(format!("deserialise {key}: {e}")))
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tokio_test::{assert_err, assert_ok};

    fn position(symbol: &str, entry: f64, at: DateTime<Utc>) -> Position {
        Position {
            id: Uuid::new_v4(),
            trade_id: None,
            symbol: symbol.to_string(),
            entry_price: entry,
            quantity: 1.5,
            entry_time: at,
            stop_loss: entry * 0.98,
            take_profit: entry * 1.03,
            high_water_mark: entry,
            trailing_active: false,
            level_mode: LevelMode::Atr,
            entry_score: 7.8,
            sub_scores: SubScores {
                volatility: 8.0,
                volume: 10.0,
                momentum: 6.0,
                technical: 5.5,
                risk: 9.0,
            },
        }
    }

    fn noon(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_open_then_close_updates_same_row() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut pos = position("SOLUSDT", 100.0, noon(1));
        let id = assert_ok!(ledger.open_trade(&pos).await);
        pos.trade_id = Some(id);

        let loaded = ledger.load_open_trade().await.unwrap().unwrap();
        assert_eq!(loaded.trade_id, Some(id));
        assert_eq!(loaded.id, pos.id);
        assert_eq!(loaded.entry_time, pos.entry_time);
        assert_eq!(loaded.sub_scores, pos.sub_scores);

        let rec = TradeRecord::close(pos, 103.0, noon(1) + Duration::minutes(5), ExitReason::TakeProfit);
        let closed_id = assert_ok!(ledger.close_trade(&rec).await);
        assert_eq!(closed_id, id);

        let rows = ledger.recent_trades(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_open());
        let back = rows[0].to_record().unwrap().unwrap();
        assert_eq!(back.exit_reason, ExitReason::TakeProfit);
        assert_eq!(back.duration_seconds, 300);
        assert!(ledger.load_open_trade().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_without_open_inserts_full_row() {
        let ledger = Ledger::in_memory().await.unwrap();
        let pos = position("ETHUSDT", 2000.0, noon(2));
        let rec = TradeRecord::close(pos, 1990.0, noon(2) + Duration::minutes(2), ExitReason::StopLoss);
        assert_ok!(ledger.close_trade(&rec).await);

        let rows = ledger.recent_trades(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "CLOSED");
        assert_eq!(rows[0].symbol, "ETHUSDT");
        assert_eq!(rows[0].exit_reason.as_deref(), Some("STOP_LOSS"));
        assert!((rows[0].entry_score - 7.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_repeated_close_keeps_one_row() {
        let ledger = Ledger::in_memory().await.unwrap();
        let pos = position("ADAUSDT", 0.5, noon(4));
        let rec = TradeRecord::close(pos, 0.49, noon(4) + Duration::minutes(1), ExitReason::StopLoss);
        let first = assert_ok!(ledger.close_trade(&rec).await);
        let second = assert_ok!(ledger.close_trade(&rec).await);
        assert_eq!(first, second);

        assert_eq!(ledger.recent_trades(10).await.unwrap().len(), 1);
        let agg = ledger.daily_aggregate(noon(4).date_naive()).await.unwrap();
        assert_eq!(agg.total_trades, 1);
    }

    #[tokio::test]
    async fn test_daily_aggregate_recomputed() {
        let ledger = Ledger::in_memory().await.unwrap();
        let day = noon(3);

        let empty = ledger.daily_aggregate(day.date_naive()).await.unwrap();
        assert_eq!(empty.total_trades, 0);

        for (exit, mins) in [(102.0, 10), (99.0, 20), (101.0, 30)] {
            let pos = position("BNBUSDT", 100.0, day);
            let rec = TradeRecord::close(pos, exit, day + Duration::minutes(mins), ExitReason::MaxDuration);
            ledger.close_trade(&rec).await.unwrap();
        }

        let agg = ledger.daily_aggregate(day.date_naive()).await.unwrap();
        assert_eq!(agg.total_trades, 3);
        assert_eq!(agg.winning_trades, 2);
        assert_eq!(agg.losing_trades, 1);
        assert!((agg.total_profit_percent - 2.0).abs() < 1e-9);
        assert!((agg.total_profit_usd - 3.0).abs() < 1e-9);
        assert!((agg.best_trade_percent - 2.0).abs() < 1e-9);
        assert!((agg.worst_trade_percent + 1.0).abs() < 1e-9);
        assert!((agg.win_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(agg.avg_duration_seconds, 1200);

        // A different day stays untouched.
        let other = ledger.daily_aggregate(noon(4).date_naive()).await.unwrap();
        assert_eq!(other.total_trades, 0);
    }

    #[tokio::test]
    async fn test_update_levels_persists_trailing() {
        let ledger = Ledger::in_memory().await.unwrap();
        let pos = position("XRPUSDT", 1.0, noon(5));
        let id = ledger.open_trade(&pos).await.unwrap();
        ledger.update_levels(id, 0.995, 1.02, true).await.unwrap();

        let loaded = ledger.load_open_trade().await.unwrap().unwrap();
        assert!(loaded.trailing_active);
        assert!((loaded.stop_loss - 0.995).abs() < 1e-12);
        assert!((loaded.high_water_mark - 1.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_state_last_write_wins() {
        let ledger = Ledger::in_memory().await.unwrap();
        assert_eq!(ledger.get_state::<u32>("consecutive_losses").await.unwrap(), None);
        ledger.set_state("consecutive_losses", &2u32).await.unwrap();
        ledger.set_state("consecutive_losses", &0u32).await.unwrap();
        assert_eq!(ledger.get_state::<u32>("consecutive_losses").await.unwrap(), Some(0));

        ledger.set_state("note", "hello").await.unwrap();
        assert_err!(ledger.get_state::<u32>("note").await);
    }

    #[tokio::test]
    async fn test_all_time_stats() {
        let ledger = Ledger::in_memory().await.unwrap();
        let empty = ledger.all_time_stats().await.unwrap();
        assert_eq!(empty, AllTimeStats::default());

        for (day, exit) in [(6, 101.0), (7, 98.0)] {
            let pos = position("ADAUSDT", 100.0, noon(day));
            let rec = TradeRecord::close(pos, exit, noon(day) + Duration::minutes(1), ExitReason::StopLoss);
            ledger.close_trade(&rec).await.unwrap();
        }
        // Open trades are excluded.
        ledger.open_trade(&position("BTCUSDT", 50_000.0, noon(8))).await.unwrap();

        let stats = ledger.all_time_stats().await.unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.avg_profit_percent + 0.5).abs() < 1e-9);
        assert!((stats.best_trade_percent - 1.0).abs() < 1e-9);
        assert!((stats.worst_trade_percent + 2.0).abs() < 1e-9);
    }
}
