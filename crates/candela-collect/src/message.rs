//! Decoding of the exchange's push-feed frames.
//!
//! Subscriptions are issued as
//! `{"op":"subscribe","args":[{"channel":"candle{bar}","instId":sym}]}`;
//! data frames carry the same 9-column rows as the history endpoint.

use candela_fetch::{parse_candle_row, ParseError};
use candela_types::{Candle, CandleSource, Timeframe};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors decoding a push frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Frame was not valid JSON.
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame shape was recognized but a candle row was malformed.
    #[error("Malformed candle row: {0}")]
    Row(#[from] ParseError),

    /// The channel name does not map to a known timeframe.
    #[error("Unknown channel {0:?}")]
    UnknownChannel(String),

    /// JSON that matches none of the known frame shapes.
    #[error("Unrecognized frame shape")]
    Unrecognized,
}

/// A decoded frame from the push feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to our keepalive ping.
    Pong,
    /// Subscription acknowledged.
    SubscribeAck {
        /// Channel that was acknowledged.
        channel: String,
        /// Instrument the ack is for.
        inst_id: String,
    },
    /// The exchange rejected a request.
    Error {
        /// Exchange error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Candle updates for one (instrument, timeframe).
    Candles(Vec<Candle>),
}

#[derive(Debug, Deserialize)]
struct ChannelArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<ChannelArg>,
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    arg: ChannelArg,
    data: Vec<Vec<String>>,
}

/// Renders the subscribe request for one (symbol, timeframe) channel.
#[must_use]
pub fn subscribe_request(symbol: &str, timeframe: Timeframe) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": timeframe.channel(), "instId": symbol }],
    })
    .to_string()
}

/// Renders the matching unsubscribe request.
#[must_use]
pub fn unsubscribe_request(symbol: &str, timeframe: Timeframe) -> String {
    json!({
        "op": "unsubscribe",
        "args": [{ "channel": timeframe.channel(), "instId": symbol }],
    })
    .to_string()
}

/// Decodes one text frame.
///
/// # Errors
///
/// Returns an error for malformed JSON, unknown channels, or bad rows;
/// callers drop and count these without touching the connection.
pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    if text == "pong" {
        return Ok(Frame::Pong);
    }

    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("event").is_some() {
        let event: EventFrame = serde_json::from_value(value)?;
        return match event.event.as_str() {
            "subscribe" | "unsubscribe" => {
                let arg = event.arg.ok_or(FrameError::Unrecognized)?;
                Ok(Frame::SubscribeAck {
                    channel: arg.channel,
                    inst_id: arg.inst_id,
                })
            }
            "error" => Ok(Frame::Error {
                code: event.code.unwrap_or_default(),
                message: event.msg.unwrap_or_default(),
            }),
            _ => Err(FrameError::Unrecognized),
        };
    }

    if value.get("data").is_some() && value.get("arg").is_some() {
        let push: PushFrame = serde_json::from_value(value)?;
        let timeframe = Timeframe::from_channel(&push.arg.channel)
            .ok_or_else(|| FrameError::UnknownChannel(push.arg.channel.clone()))?;
        let mut candles = Vec::with_capacity(push.data.len());
        for row in &push.data {
            candles.push(parse_candle_row(
                &push.arg.inst_id,
                timeframe,
                row,
                CandleSource::Stream,
            )?);
        }
        return Ok(Frame::Candles(candles));
    }

    Err(FrameError::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_request_shape() {
        let req = subscribe_request("BTC-USDT-SWAP", Timeframe::Hour1);
        let value: serde_json::Value = serde_json::from_str(&req).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "candle1H");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT-SWAP");
    }

    #[test]
    fn test_parse_pong() {
        assert_eq!(parse_frame("pong").unwrap(), Frame::Pong);
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let text = r#"{"event":"subscribe","arg":{"channel":"candle5m","instId":"BTC-USDT-SWAP"},"connId":"abc"}"#;
        let frame = parse_frame(text).unwrap();
        assert_eq!(
            frame,
            Frame::SubscribeAck {
                channel: "candle5m".to_string(),
                inst_id: "BTC-USDT-SWAP".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_error_frame() {
        let text = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        let frame = parse_frame(text).unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                code: "60012".to_string(),
                message: "Invalid request".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_candle_push() {
        let text = r#"{
            "arg": {"channel":"candle5m","instId":"BTC-USDT-SWAP"},
            "data": [["1704067500000","42000","42100","41950","42050","12.5","525600","525600","0"]]
        }"#;
        let Frame::Candles(candles) = parse_frame(text).unwrap() else {
            panic!("expected candle frame");
        };
        assert_eq!(candles.len(), 1);
        let candle = &candles[0];
        assert_eq!(candle.symbol, "BTC-USDT-SWAP");
        assert_eq!(candle.timeframe, Timeframe::Minute5);
        assert_eq!(candle.ts, 1_704_067_500_000);
        assert_eq!(candle.close, dec!(42050));
        assert!(!candle.confirmed);
        assert_eq!(candle.source, CandleSource::Stream);
    }

    #[test]
    fn test_confirm_column_sets_confirmed() {
        let text = r#"{
            "arg": {"channel":"candle5m","instId":"BTC-USDT-SWAP"},
            "data": [["1704067500000","42000","42100","41950","42050","12.5","525600","525600","1"]]
        }"#;
        let Frame::Candles(candles) = parse_frame(text).unwrap() else {
            panic!("expected candle frame");
        };
        assert!(candles[0].confirmed);
    }

    #[test]
    fn test_malformed_frames_error_out() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"something":"else"}"#).is_err());
        assert!(matches!(
            parse_frame(r#"{"arg":{"channel":"candle7w","instId":"X"},"data":[]}"#),
            Err(FrameError::UnknownChannel(_))
        ));
        // Short row inside an otherwise valid frame.
        assert!(matches!(
            parse_frame(r#"{"arg":{"channel":"candle5m","instId":"X"},"data":[["1704067500000"]]}"#),
            Err(FrameError::Row(_))
        ));
    }
}
