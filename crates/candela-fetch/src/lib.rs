//! Historical candle fetching for candela.
//!
//! Closed candles come from the exchange's paginated history endpoint:
//!
//! - [`RestClient`] - Pooled, paced HTTP client with bounded retries
//! - [`HistoricalSource`] - The trait the reconciliation engine fetches through
//! - [`parse_candle_row`] - Wire-row decoding shared by the fetch paths

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod parse;
mod source;

pub use client::{FetchError, RestClient, RestConfig, PAGE_LIMIT};
pub use parse::{parse_candle_row, ParseError};
pub use source::HistoricalSource;
