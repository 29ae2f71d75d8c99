//! Connects to a live feed endpoint and logs whatever arrives.
//!
//! Endpoint comes from DESK_FEED_URL; defaults to a local dev server.
//!
//! ```sh
//! DESK_FEED_URL=wss://feed.example.com/stream cargo run --example live_feed
//! ```

use std::time::Duration;

use desk_core::{FeedMessage, FeedRequest, Timeframe};
use desk_feed::{FeedCallbacks, FeedRegistry};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,desk_feed=debug")),
        )
        .init();

    let endpoint =
        std::env::var("DESK_FEED_URL").unwrap_or_else(|_| "ws://127.0.0.1:9001/stream".to_string());
    info!("connecting to {}", endpoint);

    let registry = FeedRegistry::with_defaults();
    let subscription = registry.acquire(
        &endpoint,
        FeedCallbacks::new()
            .on_open(|| info!("feed open"))
            .on_message(|message| match message {
                FeedMessage::MarketOverview { tickers } => {
                    info!("overview: {} tickers", tickers.len());
                }
                FeedMessage::ChartUpdate { symbol, timeframe, bar } => {
                    info!("chart {} {}: close {}", symbol, timeframe, bar.close);
                }
                FeedMessage::Pong { .. } => {}
                FeedMessage::Error { code, message } => {
                    info!("backend error ({:?}): {}", code, message);
                }
            })
            .on_close(|event| info!("feed closed (normal: {})", event.normal))
            .on_error(|e| info!("feed error: {}", e)),
    );

    // Give the handshake a moment, then configure the chart stream
    tokio::time::sleep(Duration::from_secs(2)).await;
    subscription.send(&FeedRequest::Subscribe {
        symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
    });
    subscription.send(&FeedRequest::Configure {
        timeframe: Timeframe::M5,
        indicators: vec!["ema_20".into(), "rsi_14".into()],
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    subscription.release();
    Ok(())
}
