//! Decoding of the exchange's candle REST payloads.
//!
//! History rows are 9-column string arrays:
//! `[ts, open, high, low, close, volume, volCcy, volCcyQuote, confirm]`.

use std::str::FromStr;

use candela_types::{Candle, CandleSource, Timeframe};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::client::FetchError;

/// Errors decoding a candle payload.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Body was not valid JSON of the expected envelope shape.
    #[error("Invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// A data row had fewer columns than the wire format requires.
    #[error("Candle row has {got} columns, expected at least {MIN_COLUMNS}")]
    MissingColumns {
        /// Columns present in the row.
        got: usize,
    },

    /// A column could not be parsed as a number.
    #[error("Bad {column} value {value:?}")]
    BadNumber {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Minimum columns in a candle row (`volCcyQuote` and `confirm` included).
const MIN_COLUMNS: usize = 9;

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Vec<String>>,
}

fn decimal(column: &'static str, value: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(value).map_err(|_| ParseError::BadNumber {
        column,
        value: value.to_string(),
    })
}

/// Parses one wire row into a [`Candle`].
///
/// # Errors
///
/// Returns an error if the row is short or a column is non-numeric.
pub fn parse_candle_row(
    symbol: &str,
    timeframe: Timeframe,
    row: &[String],
    source: CandleSource,
) -> Result<Candle, ParseError> {
    if row.len() < MIN_COLUMNS {
        return Err(ParseError::MissingColumns { got: row.len() });
    }
    let ts = row[0]
        .parse::<i64>()
        .map_err(|_| ParseError::BadNumber {
            column: "ts",
            value: row[0].clone(),
        })?;
    Ok(Candle {
        symbol: symbol.to_string(),
        timeframe,
        ts,
        open: decimal("open", &row[1])?,
        high: decimal("high", &row[2])?,
        low: decimal("low", &row[3])?,
        close: decimal("close", &row[4])?,
        volume: decimal("volume", &row[5])?,
        quote_volume: decimal("quote_volume", &row[7])?,
        confirmed: row[8] == "1",
        received_at: Utc::now(),
        source,
    })
}

/// Decodes a history-candles response body into candles, newest first.
///
/// # Errors
///
/// Returns [`FetchError::Api`] when the exchange reports a non-zero code,
/// or a parse error for a malformed body.
pub(crate) fn parse_history_response(
    symbol: &str,
    timeframe: Timeframe,
    body: &str,
) -> Result<Vec<Candle>, FetchError> {
    let envelope: ApiEnvelope = serde_json::from_str(body).map_err(ParseError::from)?;
    if envelope.code != "0" {
        return Err(FetchError::Api {
            code: envelope.code,
            message: envelope.msg,
        });
    }
    let mut candles = Vec::with_capacity(envelope.data.len());
    for row in &envelope.data {
        let mut candle = parse_candle_row(symbol, timeframe, row, CandleSource::Backfill)?;
        // History rows are closed buckets even when the confirm column is
        // absent-as-zero on some instruments.
        candle.confirmed = true;
        candles.push(candle);
    }
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const BODY: &str = r#"{
        "code": "0",
        "msg": "",
        "data": [
            ["1704067800000","42050","42120","42040","42100","8.2","344900","344900","1"],
            ["1704067500000","42000","42100","41950","42050","12.5","525600","525600","1"]
        ]
    }"#;

    #[test]
    fn test_parse_history_response() {
        let candles = parse_history_response("BTC-USDT-SWAP", Timeframe::Minute5, BODY).unwrap();
        assert_eq!(candles.len(), 2);
        // Newest first on the wire.
        assert_eq!(candles[0].ts, 1_704_067_800_000);
        assert_eq!(candles[1].ts, 1_704_067_500_000);
        assert_eq!(candles[1].open, dec!(42000));
        assert_eq!(candles[1].quote_volume, dec!(525600));
        assert!(candles.iter().all(|c| c.confirmed));
        assert!(candles
            .iter()
            .all(|c| c.source == CandleSource::Backfill));
    }

    #[test]
    fn test_api_error_code_surfaces() {
        let body = r#"{"code":"51001","msg":"Instrument ID does not exist","data":[]}"#;
        let err = parse_history_response("NOPE-USDT", Timeframe::Minute5, body).unwrap_err();
        assert!(matches!(err, FetchError::Api { code, .. } if code == "51001"));
    }

    #[test]
    fn test_short_row_rejected() {
        let row: Vec<String> = vec!["1704067500000".to_string(), "42000".to_string()];
        let err = parse_candle_row("BTC-USDT-SWAP", Timeframe::Minute5, &row, CandleSource::Stream)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingColumns { got: 2 }));
    }

    #[test]
    fn test_bad_number_rejected() {
        let mut row: Vec<String> = [
            "1704067500000",
            "42000",
            "42100",
            "41950",
            "42050",
            "12.5",
            "525600",
            "525600",
            "1",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        row[2] = "not-a-price".to_string();
        let err = parse_candle_row("BTC-USDT-SWAP", Timeframe::Minute5, &row, CandleSource::Stream)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadNumber { column: "high", .. }));
    }
}
