//! Signed REST client for the futures venue
//!
//! Implements [`VenueExecutor`]. Every request carries an explicit deadline;
//! rejections are classified into the closed [`VenueErrorKind`] taxonomy so
//! the call sites can apply their shrink/backoff policies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::debug;
use reqwest::{Method, StatusCode};
use sha2::Sha256;

use crate::grid::errors::{VenueError, VenueErrorKind};
use crate::grid::executor::VenueExecutor;
use crate::grid::types::{OrderSide, PositionSide, VenueOrder, VenuePosition};
use crate::venue::types::{ApiError, OpenOrder, OrderAck, PositionRisk};

const REQUEST_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_RECV_WINDOW: u64 = 5_000;

/// Venue error code: margin is insufficient
const CODE_MARGIN_INSUFFICIENT: i64 = -2019;
/// Venue error code: reduce-only order rejected
const CODE_REDUCE_ONLY_REJECTED: i64 = -2022;
/// Venue error code: request weight exceeded
const CODE_RATE_LIMIT: i64 = -1003;
/// Venue error code: unknown order (already gone)
const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Venue error code: margin type already set
const CODE_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

pub(crate) fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Map a non-2xx response onto the closed error taxonomy
fn classify_rejection(status: StatusCode, code: i64, msg: &str) -> VenueError {
    let kind = match code {
        CODE_MARGIN_INSUFFICIENT => VenueErrorKind::MarginInsufficient,
        CODE_REDUCE_ONLY_REJECTED => VenueErrorKind::ReduceOnlyRejected,
        CODE_RATE_LIMIT => VenueErrorKind::RateLimited,
        _ if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 => {
            VenueErrorKind::RateLimited
        }
        _ if status.is_server_error() => VenueErrorKind::Transient,
        _ => VenueErrorKind::Fatal,
    };
    VenueError::new(kind, format!("{status} code={code}: {msg}"))
}

pub struct BinanceFuturesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
    order_seq: AtomicU64,
}

impl BinanceFuturesClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(|e| VenueError::fatal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window: DEFAULT_RECV_WINDOW,
            order_seq: AtomicU64::new(1),
        })
    }

    /// Client-supplied id so a retried placement stays idempotent venue-side
    fn next_client_order_id(&self) -> String {
        format!(
            "gm-{}-{}",
            timestamp_ms(),
            self.order_seq.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, VenueError> {
        params.push(("timestamp".into(), timestamp_ms().to_string()));
        params.push(("recvWindow".into(), self.recv_window.to_string()));

        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign_query(&self.api_secret, &query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        debug!("{} {}", method, path);
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    VenueError::transient(e.to_string())
                } else {
                    VenueError::fatal(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VenueError::transient(e.to_string()))?;

        if !status.is_success() {
            let api_err: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
                code: 0,
                msg: body.clone(),
            });
            return Err(classify_rejection(status, api_err.code, &api_err.msg));
        }

        serde_json::from_str(&body)
            .map_err(|e| VenueError::fatal(format!("unparseable response: {e}")))
    }

    fn parse_ack(value: serde_json::Value) -> Result<String, VenueError> {
        let ack: OrderAck = serde_json::from_value(value)
            .map_err(|e| VenueError::fatal(format!("order ack: {e}")))?;
        Ok(ack.order_id.to_string())
    }
}

fn fmt_decimal(value: f64) -> String {
    format!("{value}")
}

#[async_trait]
impl VenueExecutor for BinanceFuturesClient {
    async fn place_limit_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
    ) -> Result<String, VenueError> {
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("side".into(), side.as_str().to_string()),
            ("type".into(), "LIMIT".into()),
            ("timeInForce".into(), "GTC".into()),
            ("price".into(), fmt_decimal(price)),
            ("quantity".into(), fmt_decimal(qty)),
            ("newClientOrderId".into(), self.next_client_order_id()),
        ];
        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Self::parse_ack(value)
    }

    async fn place_limit_close(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
    ) -> Result<String, VenueError> {
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("side".into(), side.as_str().to_string()),
            ("type".into(), "LIMIT".into()),
            ("timeInForce".into(), "GTC".into()),
            ("price".into(), fmt_decimal(price)),
            ("quantity".into(), fmt_decimal(qty)),
            ("reduceOnly".into(), "true".into()),
            ("newClientOrderId".into(), self.next_client_order_id()),
        ];
        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Self::parse_ack(value)
    }

    async fn place_stop_market_close(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
    ) -> Result<String, VenueError> {
        // closePosition=true: the venue closes the whole position at trigger;
        // no quantity and no reduceOnly field may be sent
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("side".into(), side.as_str().to_string()),
            ("type".into(), "STOP_MARKET".into()),
            ("stopPrice".into(), fmt_decimal(stop_price)),
            ("closePosition".into(), "true".into()),
            ("newClientOrderId".into(), self.next_client_order_id()),
        ];
        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Self::parse_ack(value)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("orderId".into(), order_id.to_string()),
        ];
        match self
            .signed_request(Method::DELETE, "/fapi/v1/order", params)
            .await
        {
            Ok(_) => Ok(()),
            // already filled or cancelled is success for our purposes
            Err(e) if e.message.contains(&CODE_UNKNOWN_ORDER.to_string()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), VenueError> {
        let params = vec![("symbol".into(), symbol.to_string())];
        self.signed_request(Method::DELETE, "/fapi/v1/allOpenOrders", params)
            .await?;
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<VenuePosition, VenueError> {
        let params = vec![("symbol".into(), symbol.to_string())];
        let value = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", params)
            .await?;
        let rows: Vec<PositionRisk> = serde_json::from_value(value)
            .map_err(|e| VenueError::fatal(format!("positionRisk: {e}")))?;

        for row in rows {
            let amt: f64 = row.position_amt.parse().unwrap_or(0.0);
            if amt != 0.0 {
                return Ok(VenuePosition {
                    side: if amt > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    qty: amt.abs(),
                    avg_price: row.entry_price.parse().unwrap_or(0.0),
                    unrealized_pnl: row.un_realized_profit.parse().unwrap_or(0.0),
                });
            }
        }
        Ok(VenuePosition::flat())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<VenueOrder>, VenueError> {
        let params = vec![("symbol".into(), symbol.to_string())];
        let value = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", params)
            .await?;
        let rows: Vec<OpenOrder> = serde_json::from_value(value)
            .map_err(|e| VenueError::fatal(format!("openOrders: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let stop = row.stop_price.parse::<f64>().ok().filter(|p| *p > 0.0);
                VenueOrder {
                    order_id: row.order_id.to_string(),
                    side: if row.side == "BUY" {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    order_type: row.order_type,
                    price: row.price.parse().unwrap_or(0.0),
                    stop_price: stop,
                    qty: row.orig_qty.parse().unwrap_or(0.0),
                    reduce_only: row.reduce_only,
                }
            })
            .collect())
    }

    async fn set_margin_mode_isolated(&self, symbol: &str) -> Result<(), VenueError> {
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("marginType".into(), "ISOLATED".into()),
        ];
        match self
            .signed_request(Method::POST, "/fapi/v1/marginType", params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.message.contains(&CODE_NO_NEED_TO_CHANGE_MARGIN.to_string()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let params = vec![
            ("symbol".into(), symbol.to_string()),
            ("leverage".into(), leverage.to_string()),
        ];
        self.signed_request(Method::POST, "/fapi/v1/leverage", params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic_hex() {
        let sig = sign_query("secret", "symbol=BTCUSDC&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign_query("secret", "symbol=BTCUSDC&timestamp=1"));
        assert_ne!(sig, sign_query("other", "symbol=BTCUSDC&timestamp=1"));
    }

    #[test]
    fn test_rejection_classification() {
        let margin = classify_rejection(StatusCode::BAD_REQUEST, -2019, "Margin is insufficient");
        assert_eq!(margin.kind, VenueErrorKind::MarginInsufficient);

        let reduce = classify_rejection(StatusCode::BAD_REQUEST, -2022, "ReduceOnly rejected");
        assert_eq!(reduce.kind, VenueErrorKind::ReduceOnlyRejected);

        let weight = classify_rejection(StatusCode::TOO_MANY_REQUESTS, 0, "slow down");
        assert_eq!(weight.kind, VenueErrorKind::RateLimited);

        let outage = classify_rejection(StatusCode::BAD_GATEWAY, 0, "upstream");
        assert_eq!(outage.kind, VenueErrorKind::Transient);

        let bad = classify_rejection(StatusCode::BAD_REQUEST, -1102, "mandatory param");
        assert_eq!(bad.kind, VenueErrorKind::Fatal);
    }

    #[test]
    fn test_client_order_ids_are_unique() {
        let client = BinanceFuturesClient::new("https://example.invalid", "k", "s").unwrap();
        let a = client.next_client_order_id();
        let b = client.next_client_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("gm-"));
    }

    #[test]
    fn test_decimal_formatting_is_minimal() {
        assert_eq!(fmt_decimal(99500.0), "99500");
        assert_eq!(fmt_decimal(0.00753), "0.00753");
        assert_eq!(fmt_decimal(99997.5), "99997.5");
    }
}
