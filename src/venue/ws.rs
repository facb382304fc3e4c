//! Kline WebSocket stream with reconnect and silence timeout

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::grid::types::KlineClose;
use crate::venue::types::KlineEvent;

/// No frame for this long means the connection is dead; reconnect.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(90);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Convert a closed-bar payload into the engine's event type
fn parse_closed_bar(text: &str) -> Option<KlineClose> {
    let event: KlineEvent = serde_json::from_str(text).ok()?;
    let k = event.kline?;
    if !k.is_closed {
        return None;
    }
    Some(KlineClose {
        open: k.open.parse().ok()?,
        high: k.high.parse().ok()?,
        low: k.low.parse().ok()?,
        close: k.close.parse().ok()?,
        volume: k.volume.parse().ok()?,
        close_time: Utc.timestamp_millis_opt(k.close_time).single()?,
    })
}

/// Spawn the stream task: connects to `<ws_base>/ws/<symbol>@kline_1m`,
/// forwards closed bars, reconnects forever. The task ends only when the
/// receiving side is dropped.
pub fn spawn_kline_stream(
    ws_base: String,
    symbol: String,
    tx: mpsc::Sender<KlineClose>,
) -> JoinHandle<()> {
    let url = format!(
        "{}/ws/{}@kline_1m",
        ws_base.trim_end_matches('/'),
        symbol.to_lowercase()
    );

    tokio::spawn(async move {
        loop {
            info!("connecting kline stream: {}", url);
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => loop {
                    match tokio::time::timeout(SILENCE_TIMEOUT, ws.next()).await {
                        Err(_) => {
                            warn!("kline stream silent for {:?}, reconnecting", SILENCE_TIMEOUT);
                            break;
                        }
                        Ok(None) => {
                            warn!("kline stream closed by venue, reconnecting");
                            break;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(bar) = parse_closed_bar(&text) {
                                if tx.send(bar).await.is_err() {
                                    info!("kline consumer gone, stream task exiting");
                                    return;
                                }
                            }
                        }
                        Ok(Some(Ok(_))) => {
                            // pings are answered by the library; other frames
                            // carry nothing we consume
                        }
                        Ok(Some(Err(e))) => {
                            error!("kline stream error: {}, reconnecting", e);
                            break;
                        }
                    }
                },
                Err(e) => {
                    error!("kline connect failed: {}", e);
                }
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":1706000000123,"s":"BTCUSDC",
                "k":{{"t":1706000000000,"T":1706000059999,"s":"BTCUSDC","i":"1m",
                     "o":"99950.0","c":"100000.1","h":"100010.0","l":"99900.0",
                     "v":"12.345","x":{closed}}}}}"#
        )
    }

    #[test]
    fn test_closed_bar_parses() {
        let bar = parse_closed_bar(&sample(true)).unwrap();
        assert_eq!(bar.close, 100_000.1);
        assert_eq!(bar.high, 100_010.0);
        assert_eq!(bar.close_time.timestamp_millis(), 1_706_000_059_999);
    }

    #[test]
    fn test_open_bar_is_dropped() {
        assert!(parse_closed_bar(&sample(false)).is_none());
    }

    #[test]
    fn test_garbage_is_dropped() {
        assert!(parse_closed_bar("not json").is_none());
        assert!(parse_closed_bar(r#"{"e":"aggTrade"}"#).is_none());
    }
}
