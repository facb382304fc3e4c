//! Binance USDⓈ-M futures client: signed REST plus the kline stream

mod rest;
pub mod types;
mod ws;

pub use rest::BinanceFuturesClient;
pub use ws::spawn_kline_stream;

/// Production REST endpoint
pub const MAINNET_REST_URL: &str = "https://fapi.binance.com";
/// Production market-data stream endpoint
pub const MAINNET_WS_URL: &str = "wss://fstream.binance.com";
/// Testnet REST endpoint
pub const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
/// Testnet market-data stream endpoint
pub const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";
