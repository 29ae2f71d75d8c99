//! Core types for the Market Desk real-time client
//!
//! This crate defines the shared data structures used across the desk
//! crates: the wire protocol spoken with the market-data feed, connection
//! lifecycle states, and the workspace-wide error type.

pub mod error;
pub mod message;
pub mod state;
pub mod timeframe;

pub use error::{DeskError, DeskResult};
pub use message::{ChartBar, FeedMessage, FeedRequest, MarketTicker};
pub use state::ConnectionState;
pub use timeframe::Timeframe;
