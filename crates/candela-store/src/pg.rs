//! Postgres candle store over a monthly-partitioned table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use candela_types::{Candle, CandleKey, CandleSource, Timeframe, TimeRange};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, warn};

use crate::schema;
use crate::store::{CandleStore, RejectedCandle, StoreError, UpsertOutcome};
use crate::RejectReason;

/// Rows per multi-VALUES upsert statement.
const UPSERT_CHUNK: usize = 500;

/// Columns bound per candle row in the upsert statement.
const UPSERT_COLS: usize = 12;

/// Postgres implementation of [`CandleStore`].
///
/// All writers share this store; the `ON CONFLICT .. WHERE NOT confirmed`
/// guard makes confirmed rows immutable even against a racing writer.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the store and verifies the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] if the database is unreachable;
    /// this is fatal at startup by design.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool (used by tests and migrations tooling).
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the parent tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(schema::CREATE_CANDLES).execute(&self.pool).await?;
        sqlx::query(schema::CREATE_PERMANENT_FAILURES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Creates the monthly partitions covering `[from_ms, to_ms]`, plus one
    /// month of headroom.
    ///
    /// # Errors
    ///
    /// Returns an error if partition DDL fails.
    pub async fn ensure_partitions(&self, from_ms: i64, to_ms: i64) -> Result<(), StoreError> {
        for spec in schema::month_partitions(from_ms, to_ms) {
            sqlx::query(&spec.ddl()).execute(&self.pool).await?;
            debug!(partition = %spec.name, "ensured candle partition");
        }
        Ok(())
    }
}

fn candle_from_row(row: &PgRow) -> Result<Candle, sqlx::Error> {
    let timeframe: String = row.try_get("timeframe")?;
    let timeframe = Timeframe::from_str(&timeframe).map_err(|e| sqlx::Error::ColumnDecode {
        index: "timeframe".to_string(),
        source: Box::new(e),
    })?;
    let source: String = row.try_get("source")?;
    let source = match source.as_str() {
        "backfill" => CandleSource::Backfill,
        _ => CandleSource::Stream,
    };
    let received_at: DateTime<Utc> = row.try_get("received_at")?;
    Ok(Candle {
        symbol: row.try_get("symbol")?,
        timeframe,
        ts: row.try_get("ts")?,
        open: row.try_get::<Decimal, _>("open")?,
        high: row.try_get::<Decimal, _>("high")?,
        low: row.try_get::<Decimal, _>("low")?,
        close: row.try_get::<Decimal, _>("close")?,
        volume: row.try_get::<Decimal, _>("volume")?,
        quote_volume: row.try_get::<Decimal, _>("quote_volume")?,
        confirmed: row.try_get("confirmed")?,
        received_at,
        source,
    })
}

/// Collapses repeated keys to their last occurrence.
///
/// The stream re-sends the open bucket on every tick, so a single batch
/// routinely carries several revisions of one key. Postgres refuses a
/// multi-VALUES `ON CONFLICT DO UPDATE` that touches the same row twice,
/// and last-write-wins is the resolution rule anyway.
fn dedup_last<'a>(candles: impl IntoIterator<Item = &'a Candle>) -> Vec<&'a Candle> {
    let mut slots: HashMap<CandleKey, usize> = HashMap::new();
    let mut out: Vec<&Candle> = Vec::new();
    for candle in candles {
        match slots.entry(candle.key()) {
            std::collections::hash_map::Entry::Occupied(slot) => out[*slot.get()] = candle,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(candle);
            }
        }
    }
    out
}

fn upsert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT INTO candles \
         (symbol, timeframe, ts, open, high, low, close, volume, quote_volume, \
          confirmed, received_at, source) VALUES ",
    );
    let tuples: Vec<String> = (0..rows)
        .map(|i| {
            let base = i * UPSERT_COLS;
            let params: Vec<String> = (1..=UPSERT_COLS).map(|j| format!("${}", base + j)).collect();
            format!("({})", params.join(", "))
        })
        .collect();
    sql.push_str(&tuples.join(", "));
    sql.push_str(
        " ON CONFLICT (symbol, timeframe, ts) DO UPDATE SET \
           open = EXCLUDED.open, \
           high = EXCLUDED.high, \
           low = EXCLUDED.low, \
           close = EXCLUDED.close, \
           volume = EXCLUDED.volume, \
           quote_volume = EXCLUDED.quote_volume, \
           confirmed = EXCLUDED.confirmed, \
           received_at = EXCLUDED.received_at, \
           source = EXCLUDED.source \
         WHERE NOT candles.confirmed \
         RETURNING symbol, timeframe, ts",
    );
    sql
}

/// Keys under the chunk that already hold a row.
///
/// System columns like `xmax` cannot be read back through a partitioned
/// parent, so the inserted/updated split comes from comparing the
/// RETURNING set against this pre-statement snapshot instead.
async fn existing_keys(
    tx: &mut sqlx::PgConnection,
    chunk: &[&Candle],
) -> Result<HashSet<(String, String, i64)>, StoreError> {
    let symbols: Vec<String> = chunk.iter().map(|c| c.symbol.clone()).collect();
    let timeframes: Vec<String> = chunk.iter().map(|c| c.timeframe.as_str().to_string()).collect();
    let timestamps: Vec<i64> = chunk.iter().map(|c| c.ts).collect();
    let rows = sqlx::query(
        "SELECT c.symbol, c.timeframe, c.ts \
         FROM candles c \
         JOIN unnest($1::text[], $2::text[], $3::bigint[]) AS k(symbol, timeframe, ts) \
           ON c.symbol = k.symbol AND c.timeframe = k.timeframe AND c.ts = k.ts",
    )
    .bind(&symbols)
    .bind(&timeframes)
    .bind(&timestamps)
    .fetch_all(tx)
    .await?;
    let mut keys = HashSet::with_capacity(rows.len());
    for row in &rows {
        keys.insert((row.try_get("symbol")?, row.try_get("timeframe")?, row.try_get("ts")?));
    }
    Ok(keys)
}

#[async_trait]
impl CandleStore for PgStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<UpsertOutcome, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut outcome = UpsertOutcome::default();

        let deduped = dedup_last(candles);
        let mut valid: Vec<&Candle> = Vec::with_capacity(deduped.len());
        for candle in deduped {
            match candle.validate(now_ms) {
                Ok(()) => valid.push(candle),
                Err(err) => {
                    warn!(key = %candle.key(), %err, "rejecting invalid candle");
                    outcome.rejected.push(RejectedCandle {
                        key: candle.key(),
                        reason: RejectReason::Invalid(err),
                    });
                }
            }
        }
        if valid.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in valid.chunks(UPSERT_CHUNK) {
            // Snapshot taken in the same transaction; a racing writer can
            // at worst shift a count from inserted to updated.
            let existing = existing_keys(&mut *tx, chunk).await?;

            let sql = upsert_sql(chunk.len());
            let mut query = sqlx::query(&sql);
            for candle in chunk {
                query = query
                    .bind(&candle.symbol)
                    .bind(candle.timeframe.as_str())
                    .bind(candle.ts)
                    .bind(candle.open)
                    .bind(candle.high)
                    .bind(candle.low)
                    .bind(candle.close)
                    .bind(candle.volume)
                    .bind(candle.quote_volume)
                    .bind(candle.confirmed)
                    .bind(candle.received_at)
                    .bind(candle.source.as_str());
            }
            let rows = query.fetch_all(&mut *tx).await?;

            // Rows blocked by the confirmed guard produce no RETURNING entry.
            let mut written: HashSet<(String, String, i64)> = HashSet::with_capacity(rows.len());
            for row in &rows {
                let key: (String, String, i64) = (
                    row.try_get("symbol")?,
                    row.try_get("timeframe")?,
                    row.try_get("ts")?,
                );
                if existing.contains(&key) {
                    outcome.updated += 1;
                } else {
                    outcome.inserted += 1;
                }
                written.insert(key);
            }

            for candle in chunk {
                let key = (
                    candle.symbol.clone(),
                    candle.timeframe.as_str().to_string(),
                    candle.ts,
                );
                if written.contains(&key) {
                    continue;
                }
                let stored = sqlx::query(
                    "SELECT symbol, timeframe, ts, open, high, low, close, volume, \
                            quote_volume, confirmed, received_at, source \
                     FROM candles WHERE symbol = $1 AND timeframe = $2 AND ts = $3",
                )
                .bind(&candle.symbol)
                .bind(candle.timeframe.as_str())
                .bind(candle.ts)
                .fetch_optional(&mut *tx)
                .await?;
                match stored.as_ref().map(candle_from_row).transpose()? {
                    Some(stored) if stored.same_values(candle) => outcome.skipped += 1,
                    _ => {
                        warn!(
                            key = %candle.key(),
                            "upsert against confirmed row with differing values; rejected"
                        );
                        outcome.rejected.push(RejectedCandle {
                            key: candle.key(),
                            reason: RejectReason::ConfirmedImmutable,
                        });
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = sqlx::query(
            "SELECT symbol, timeframe, ts, open, high, low, close, volume, \
                    quote_volume, confirmed, received_at, source \
             FROM candles \
             WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts < $4 \
             ORDER BY ts",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(range.start_ms)
        .bind(range.end_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| candle_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn existing_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT ts FROM candles \
             WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts < $4",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(range.start_ms)
        .bind(range.end_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("ts").map_err(StoreError::from))
            .collect()
    }

    async fn invalid_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT ts FROM candles \
             WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts < $4 \
               AND (low <= 0 OR volume < 0 \
                    OR high < low \
                    OR high < open OR high < close \
                    OR low > open OR low > close)",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(range.start_ms)
        .bind(range.end_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("ts").map_err(StoreError::from))
            .collect()
    }

    async fn delete_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        timestamps: &[i64],
    ) -> Result<u64, StoreError> {
        if timestamps.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM candles \
             WHERE symbol = $1 AND timeframe = $2 AND ts = ANY($3)",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(timestamps)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn collapse_duplicates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<u64, StoreError> {
        // Duplicate keys can only exist in data loaded before the primary
        // key was in force; such rows share a ts and therefore a partition,
        // so ctid comparison is safe here.
        let result = sqlx::query(
            "DELETE FROM candles c USING ( \
                 SELECT symbol, timeframe, ts, \
                        (array_agg(ctid ORDER BY confirmed DESC, received_at DESC))[1] AS keep \
                 FROM candles \
                 WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts < $4 \
                 GROUP BY symbol, timeframe, ts \
                 HAVING count(*) > 1 \
             ) d \
             WHERE c.symbol = d.symbol AND c.timeframe = d.timeframe \
               AND c.ts = d.ts AND c.ctid <> d.keep",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(range.start_ms)
        .bind(range.end_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn active_symbols(&self, since_ms: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT symbol FROM candles WHERE ts >= $1 ORDER BY symbol",
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("symbol").map_err(StoreError::from))
            .collect()
    }

    async fn record_permanent_failure(
        &self,
        candle: &Candle,
        error: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(candle)?;
        sqlx::query(
            "INSERT INTO permanent_failures (symbol, timeframe, ts, payload, error, attempts) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&candle.symbol)
        .bind(candle.timeframe.as_str())
        .bind(candle.ts)
        .bind(payload)
        .bind(error)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
