//! Wire protocol for the market-data feed
//!
//! These types define the JSON messages exchanged with the feed endpoint.
//! Inbound messages carry a `type` discriminator; unknown or malformed
//! messages are tolerated by the consumer (logged, never propagated).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Timeframe;

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Messages received from the feed endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Snapshot of the tracked markets
    MarketOverview { tickers: Vec<MarketTicker> },
    /// New or updated candle for a chart subscription
    ChartUpdate {
        symbol: String,
        timeframe: Timeframe,
        bar: ChartBar,
    },
    /// Pong response to a client ping
    Pong {
        /// Echo of the client timestamp
        timestamp: i64,
    },
    /// Error reported by the backend
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

/// Last-trade summary for one market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTicker {
    pub symbol: String,
    pub price: Decimal,
    /// 24h change in percent
    pub change_pct: Decimal,
    pub volume: Decimal,
}

/// One OHLCV candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartBar {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Control messages sent to the feed endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRequest {
    /// Subscribe to ticker updates for the given symbols
    Subscribe { symbols: Vec<String> },
    /// Unsubscribe from the given symbols
    Unsubscribe { symbols: Vec<String> },
    /// Configure the chart stream: timeframe plus indicator list
    Configure {
        timeframe: Timeframe,
        indicators: Vec<String>,
    },
    /// Keep-alive ping
    Ping { timestamp: i64 },
}
