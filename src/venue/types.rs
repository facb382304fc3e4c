//! Wire types for the venue REST/WS API

use serde::Deserialize;

/// Error body returned with non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Acknowledgement of a placed order
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
}

/// One row of the position-risk endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    #[serde(default)]
    pub un_realized_profit: String,
}

/// One resting order from the open-orders endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub price: String,
    #[serde(default)]
    pub stop_price: String,
    pub orig_qty: String,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Kline stream event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e", default)]
    pub event_type: String,
    #[serde(rename = "k")]
    pub kline: Option<KlinePayload>,
}

/// Kline payload inside the stream event
#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    /// Whether this bar is closed
    #[serde(rename = "x")]
    pub is_closed: bool,
}
