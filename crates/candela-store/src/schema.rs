//! Schema DDL and monthly partition management.

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Parent table DDL. The primary key carries the uniqueness constraint on
/// (symbol, timeframe, ts); ts must be part of it because it is the
/// partition key.
pub(crate) const CREATE_CANDLES: &str = r"
CREATE TABLE IF NOT EXISTS candles (
    symbol       TEXT        NOT NULL,
    timeframe    TEXT        NOT NULL,
    ts           BIGINT      NOT NULL,
    open         NUMERIC     NOT NULL,
    high         NUMERIC     NOT NULL,
    low          NUMERIC     NOT NULL,
    close        NUMERIC     NOT NULL,
    volume       NUMERIC     NOT NULL,
    quote_volume NUMERIC     NOT NULL DEFAULT 0,
    confirmed    BOOLEAN     NOT NULL DEFAULT FALSE,
    received_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    source       TEXT        NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts)
) PARTITION BY RANGE (ts)
";

/// Permanent-failure log for dead-letter items past the retry ceiling.
pub(crate) const CREATE_PERMANENT_FAILURES: &str = r"
CREATE TABLE IF NOT EXISTS permanent_failures (
    id        BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    symbol    TEXT        NOT NULL,
    timeframe TEXT        NOT NULL,
    ts        BIGINT      NOT NULL,
    payload   JSONB       NOT NULL,
    error     TEXT        NOT NULL,
    attempts  INTEGER     NOT NULL,
    failed_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
";

/// One calendar-month partition of the candles table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Partition table name, e.g. `candles_y2024m01`.
    pub name: String,
    /// Inclusive lower bound, epoch milliseconds.
    pub from_ms: i64,
    /// Exclusive upper bound, epoch milliseconds.
    pub to_ms: i64,
}

impl PartitionSpec {
    /// Renders the DDL creating this partition.
    #[must_use]
    pub fn ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF candles FOR VALUES FROM ({}) TO ({})",
            self.name, self.from_ms, self.to_ms
        )
    }
}

/// Returns the partition name for the month containing `ts_ms`.
#[must_use]
pub fn partition_name(ts_ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now);
    format!("candles_y{:04}m{:02}", dt.year(), dt.month())
}

/// First millisecond of the month containing `dt`.
fn month_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid timestamp")
}

/// First millisecond of the month following `dt`.
fn next_month_start(dt: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid timestamp")
}

/// Computes the monthly partitions covering `[from_ms, to_ms]`, plus one
/// month of headroom so live ingestion never races partition creation at
/// a month boundary.
#[must_use]
pub fn month_partitions(from_ms: i64, to_ms: i64) -> Vec<PartitionSpec> {
    let from = Utc
        .timestamp_millis_opt(from_ms.min(to_ms))
        .single()
        .unwrap_or_else(Utc::now);
    let to = Utc
        .timestamp_millis_opt(from_ms.max(to_ms))
        .single()
        .unwrap_or_else(Utc::now);

    let mut partitions = Vec::new();
    let mut cursor = month_start(from);
    let cover_until = next_month_start(to);
    while cursor <= cover_until {
        let next = next_month_start(cursor);
        partitions.push(PartitionSpec {
            name: format!("candles_y{:04}m{:02}", cursor.year(), cursor.month()),
            from_ms: cursor.timestamp_millis(),
            to_ms: next.timestamp_millis(),
        });
        cursor = next;
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name() {
        // 2024-01-15T00:00:00Z
        assert_eq!(partition_name(1_705_276_800_000), "candles_y2024m01");
        // 2023-12-31T23:59:59Z
        assert_eq!(partition_name(1_704_067_199_000), "candles_y2023m12");
    }

    #[test]
    fn test_month_partitions_cover_range_with_headroom() {
        // 2024-01-15 .. 2024-02-10 needs Jan, Feb and one month of headroom.
        let parts = month_partitions(1_705_276_800_000, 1_707_523_200_000);
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["candles_y2024m01", "candles_y2024m02", "candles_y2024m03"]
        );
        // Bounds chain with no holes.
        for pair in parts.windows(2) {
            assert_eq!(pair[0].to_ms, pair[1].from_ms);
        }
    }

    #[test]
    fn test_year_rollover() {
        // 2023-12-20 .. 2024-01-05
        let parts = month_partitions(1_703_030_400_000, 1_704_412_800_000);
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["candles_y2023m12", "candles_y2024m01", "candles_y2024m02"]
        );
    }

    #[test]
    fn test_partition_ddl() {
        let spec = PartitionSpec {
            name: "candles_y2024m01".to_string(),
            from_ms: 100,
            to_ms: 200,
        };
        assert_eq!(
            spec.ddl(),
            "CREATE TABLE IF NOT EXISTS candles_y2024m01 PARTITION OF candles FOR VALUES FROM (100) TO (200)"
        );
    }
}
