//! Venue abstraction and retry policies
//!
//! The reconciler drives a [`VenueExecutor`] implementation; the live Binance
//! client lives in `crate::venue`, and tests use the scriptable mock below.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use rand::Rng;

use crate::grid::errors::{VenueError, VenueErrorKind};
use crate::grid::ladder::SymbolSpec;
use crate::grid::types::{OrderSide, VenueOrder, VenuePosition};

/// Per-attempt notional reduction when the venue reports insufficient margin
pub const MARGIN_SHRINK_STEP: f64 = 0.001;
/// Entries never shrink below this fraction of the requested notional
pub const MARGIN_FLOOR_RATIO: f64 = 0.30;
/// Per-attempt quantity reduction on a reduce-only rejection
pub const REDUCE_ONLY_SHRINK_STEP: f64 = 0.001;
/// Closes never shrink below this fraction of the requested quantity
pub const REDUCE_ONLY_FLOOR_RATIO: f64 = 0.50;
/// On-demand position polls before the tick is declared failed
pub const POSITION_POLL_ATTEMPTS: u32 = 10;

const BACKOFF_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 5_000;

/// Typed operations against the exchange
///
/// Prices and quantities are already tick/step aligned by the ladder; the
/// implementation transports them verbatim.
#[async_trait]
pub trait VenueExecutor: Send + Sync {
    /// Place a GTC limit order that opens or extends a position
    async fn place_limit_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
    ) -> Result<String, VenueError>;

    /// Place a reduce-only GTC limit order
    async fn place_limit_close(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
    ) -> Result<String, VenueError>;

    /// Place a STOP_MARKET with close-position semantics: `stopPrice` plus a
    /// closePosition flag, no quantity and no reduceOnly field.
    async fn place_stop_market_close(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
    ) -> Result<String, VenueError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), VenueError>;

    async fn get_position(&self, symbol: &str) -> Result<VenuePosition, VenueError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<VenueOrder>, VenueError>;

    async fn set_margin_mode_isolated(&self, symbol: &str) -> Result<(), VenueError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;
}

/// Retry a transient-failing operation with exponential backoff and jitter
pub async fn with_backoff<T, F, Fut>(mut operation: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, VenueError>>,
{
    let mut last = VenueError::transient("no attempt made");
    for attempt in 0..BACKOFF_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt);
                let jitter = rand::thread_rng().gen_range(0..=exp / 2);
                let delay = (exp + jitter).min(BACKOFF_CAP_MS);
                warn!(
                    "venue call failed (attempt {}/{}), retrying in {}ms: {}",
                    attempt + 1,
                    BACKOFF_ATTEMPTS,
                    delay,
                    e
                );
                last = e;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

/// Outcome of a shrink-retry placement
#[derive(Debug, Clone, PartialEq)]
pub enum ShrinkPlacement {
    /// Accepted, possibly below the requested size
    Placed { order_id: String, qty: f64 },
    /// Shrunk to the floor and still rejected; the order is skipped
    Skipped,
}

/// Place an entry, shrinking the notional by 0.1 % per margin rejection down
/// to a floor of 30 % of the request. Past the floor the level is skipped,
/// never the whole tick.
pub async fn place_entry_with_shrink<E: VenueExecutor + ?Sized>(
    venue: &E,
    spec: &SymbolSpec,
    side: OrderSide,
    price: f64,
    qty: f64,
) -> Result<ShrinkPlacement, VenueError> {
    let original = qty;
    let floor = original * MARGIN_FLOOR_RATIO;
    let mut current = original;
    let mut attempt = 0u32;

    while current >= floor {
        attempt += 1;
        let rounded = spec.truncate_qty(current);
        if rounded <= 0.0 {
            return Ok(ShrinkPlacement::Skipped);
        }

        let result = with_backoff(|| {
            venue.place_limit_entry(&spec.symbol, side, price, rounded)
        })
        .await;

        match result {
            Ok(order_id) => {
                if current < original {
                    warn!(
                        "entry accepted at {:.1}% of requested notional after {} attempts",
                        current / original * 100.0,
                        attempt
                    );
                }
                return Ok(ShrinkPlacement::Placed {
                    order_id,
                    qty: rounded,
                });
            }
            Err(e) if e.kind == VenueErrorKind::MarginInsufficient => {
                current -= original * MARGIN_SHRINK_STEP;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        "margin shrink hit {:.0}% floor after {} attempts, skipping level",
        MARGIN_FLOOR_RATIO * 100.0,
        attempt
    );
    Ok(ShrinkPlacement::Skipped)
}

/// Place a reduce-only close, shrinking the quantity by 0.1 % per rejection
/// down to a floor of 50 % of the request.
pub async fn place_close_with_shrink<E: VenueExecutor + ?Sized>(
    venue: &E,
    spec: &SymbolSpec,
    side: OrderSide,
    price: f64,
    qty: f64,
) -> Result<ShrinkPlacement, VenueError> {
    let original = qty;
    let floor = original * REDUCE_ONLY_FLOOR_RATIO;
    let mut current = original;
    let mut attempt = 0u32;

    while current >= floor {
        attempt += 1;
        let rounded = spec.truncate_qty(current);
        if rounded <= 0.0 {
            return Ok(ShrinkPlacement::Skipped);
        }

        let result = with_backoff(|| {
            venue.place_limit_close(&spec.symbol, side, price, rounded)
        })
        .await;

        match result {
            Ok(order_id) => {
                if current < original {
                    warn!(
                        "reduce-only close accepted at {:.1}% of requested qty after {} attempts",
                        current / original * 100.0,
                        attempt
                    );
                }
                return Ok(ShrinkPlacement::Placed {
                    order_id,
                    qty: rounded,
                });
            }
            Err(e) if e.kind == VenueErrorKind::ReduceOnlyRejected => {
                current -= original * REDUCE_ONLY_SHRINK_STEP;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        "reduce-only shrink hit {:.0}% floor after {} attempts, skipping close",
        REDUCE_ONLY_FLOOR_RATIO * 100.0,
        attempt
    );
    Ok(ShrinkPlacement::Skipped)
}

/// Poll the position until it answers, up to [`POSITION_POLL_ATTEMPTS`].
/// Persistent failure is fatal for the caller's tick.
pub async fn get_position_with_retry<E: VenueExecutor + ?Sized>(
    venue: &E,
    symbol: &str,
) -> Result<VenuePosition, VenueError> {
    let mut last = VenueError::transient("no attempt made");
    for attempt in 0..POSITION_POLL_ATTEMPTS {
        match venue.get_position(symbol).await {
            Ok(position) => return Ok(position),
            Err(e) => {
                warn!(
                    "position poll failed (attempt {}/{}): {}",
                    attempt + 1,
                    POSITION_POLL_ATTEMPTS,
                    e
                );
                last = e;
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
    Err(VenueError::fatal(format!(
        "position unavailable after {} attempts: {}",
        POSITION_POLL_ATTEMPTS, last
    )))
}

// ============================================================================
// Mock implementation for testing
// ============================================================================

/// Scriptable in-memory venue for exercising the reconciler without a network.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// Every accepted placement, for assertions
    #[derive(Debug, Clone, PartialEq)]
    pub struct PlacedOrder {
        pub order_id: String,
        pub side: OrderSide,
        pub order_type: String,
        pub price: f64,
        pub qty: f64,
        pub reduce_only: bool,
        pub close_position: bool,
    }

    #[derive(Default)]
    pub struct MockVenue {
        pub open_orders: Mutex<Vec<VenueOrder>>,
        pub placements: Mutex<Vec<PlacedOrder>>,
        pub cancelled: Mutex<Vec<String>>,
        pub position: Mutex<VenuePosition>,
        /// Entries above this notional are rejected with MarginInsufficient
        pub margin_cap_notional: Mutex<Option<f64>>,
        /// Closes above this qty are rejected with ReduceOnlyRejected
        pub reduce_only_cap_qty: Mutex<Option<f64>>,
        /// Remaining position polls that fail transiently
        pub position_failures: AtomicU32,
        pub write_calls: AtomicU32,
        /// Every leverage value applied, in call order
        pub leverage_updates: Mutex<Vec<u32>>,
        next_id: AtomicU64,
    }

    impl MockVenue {
        pub fn new() -> Self {
            Self {
                position: Mutex::new(VenuePosition::flat()),
                next_id: AtomicU64::new(1),
                ..Default::default()
            }
        }

        fn next_order_id(&self) -> String {
            format!("m-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        pub async fn set_position(&self, position: VenuePosition) {
            *self.position.lock().await = position;
        }

        /// Simulate a fill: drop the open order, leave position scripting to
        /// the test.
        pub async fn consume_order(&self, order_id: &str) {
            self.open_orders
                .lock()
                .await
                .retain(|o| o.order_id != order_id);
        }

        pub fn write_call_count(&self) -> u32 {
            self.write_calls.load(Ordering::SeqCst)
        }

        async fn record(
            &self,
            side: OrderSide,
            order_type: &str,
            price: f64,
            stop_price: Option<f64>,
            qty: f64,
            reduce_only: bool,
            close_position: bool,
        ) -> String {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let order_id = self.next_order_id();
            self.placements.lock().await.push(PlacedOrder {
                order_id: order_id.clone(),
                side,
                order_type: order_type.to_string(),
                price,
                qty,
                reduce_only,
                close_position,
            });
            self.open_orders.lock().await.push(VenueOrder {
                order_id: order_id.clone(),
                side,
                order_type: order_type.to_string(),
                price,
                stop_price,
                qty,
                reduce_only,
            });
            order_id
        }
    }

    #[async_trait]
    impl VenueExecutor for MockVenue {
        async fn place_limit_entry(
            &self,
            _symbol: &str,
            side: OrderSide,
            price: f64,
            qty: f64,
        ) -> Result<String, VenueError> {
            if let Some(cap) = *self.margin_cap_notional.lock().await {
                if price * qty > cap {
                    self.write_calls.fetch_add(1, Ordering::SeqCst);
                    return Err(VenueError::new(
                        VenueErrorKind::MarginInsufficient,
                        "margin is insufficient",
                    ));
                }
            }
            Ok(self
                .record(side, "LIMIT", price, None, qty, false, false)
                .await)
        }

        async fn place_limit_close(
            &self,
            _symbol: &str,
            side: OrderSide,
            price: f64,
            qty: f64,
        ) -> Result<String, VenueError> {
            if let Some(cap) = *self.reduce_only_cap_qty.lock().await {
                if qty > cap {
                    self.write_calls.fetch_add(1, Ordering::SeqCst);
                    return Err(VenueError::new(
                        VenueErrorKind::ReduceOnlyRejected,
                        "reduce-only order rejected",
                    ));
                }
            }
            Ok(self
                .record(side, "LIMIT", price, None, qty, true, false)
                .await)
        }

        async fn place_stop_market_close(
            &self,
            _symbol: &str,
            side: OrderSide,
            stop_price: f64,
        ) -> Result<String, VenueError> {
            Ok(self
                .record(side, "STOP_MARKET", 0.0, Some(stop_price), 0.0, false, true)
                .await)
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), VenueError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            self.cancelled.lock().await.push(order_id.to_string());
            self.open_orders
                .lock()
                .await
                .retain(|o| o.order_id != order_id);
            Ok(())
        }

        async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<(), VenueError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let mut orders = self.open_orders.lock().await;
            let mut cancelled = self.cancelled.lock().await;
            for order in orders.drain(..) {
                cancelled.push(order.order_id);
            }
            Ok(())
        }

        async fn get_position(&self, _symbol: &str) -> Result<VenuePosition, VenueError> {
            if self.position_failures.load(Ordering::SeqCst) > 0 {
                self.position_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(VenueError::transient("position endpoint unavailable"));
            }
            Ok(self.position.lock().await.clone())
        }

        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<VenueOrder>, VenueError> {
            Ok(self.open_orders.lock().await.clone())
        }

        async fn set_margin_mode_isolated(&self, _symbol: &str) -> Result<(), VenueError> {
            Ok(())
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), VenueError> {
            self.leverage_updates.lock().await.push(leverage);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockVenue;
    use super::*;

    fn spec() -> SymbolSpec {
        SymbolSpec::new("BTCUSDC", 0.1, 0.00001)
    }

    #[tokio::test]
    async fn test_entry_shrinks_until_accepted() {
        // S6: reject above a notional cap, accept once shrunk under it
        let venue = MockVenue::new();
        *venue.margin_cap_notional.lock().await = Some(7_100.0);

        let qty = 7_500.0 / 95_500.0; // ~7500 notional requested
        let placed = place_entry_with_shrink(&venue, &spec(), OrderSide::Buy, 95_500.0, qty)
            .await
            .unwrap();

        match placed {
            ShrinkPlacement::Placed { qty: accepted, .. } => {
                assert!(accepted * 95_500.0 <= 7_100.0 + 1.0);
                // shrunk but nowhere near the floor
                assert!(accepted > qty * MARGIN_FLOOR_RATIO);
            }
            ShrinkPlacement::Skipped => panic!("expected placement"),
        }
    }

    #[tokio::test]
    async fn test_entry_skips_below_floor() {
        // B3: margin retries stop at the 30% floor and skip the level
        let venue = MockVenue::new();
        *venue.margin_cap_notional.lock().await = Some(0.0);

        let placed = place_entry_with_shrink(&venue, &spec(), OrderSide::Buy, 95_500.0, 0.05)
            .await
            .unwrap();
        assert_eq!(placed, ShrinkPlacement::Skipped);
        assert!(venue.open_orders.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_shrinks_to_fifty_percent_floor() {
        let venue = MockVenue::new();
        *venue.reduce_only_cap_qty.lock().await = Some(0.0);

        let placed = place_close_with_shrink(&venue, &spec(), OrderSide::Sell, 99_600.0, 0.05)
            .await
            .unwrap();
        assert_eq!(placed, ShrinkPlacement::Skipped);

        // a cap at 60% of the request is reachable by shrinking
        *venue.reduce_only_cap_qty.lock().await = Some(0.03);
        let placed = place_close_with_shrink(&venue, &spec(), OrderSide::Sell, 99_600.0, 0.05)
            .await
            .unwrap();
        match placed {
            ShrinkPlacement::Placed { qty, .. } => {
                assert!(qty <= 0.03 + 1e-9);
                assert!(qty >= 0.05 * REDUCE_ONLY_FLOOR_RATIO - 1e-9);
            }
            ShrinkPlacement::Skipped => panic!("expected placement"),
        }
    }

    #[tokio::test]
    async fn test_position_retry_recovers() {
        let venue = MockVenue::new();
        venue
            .position_failures
            .store(3, std::sync::atomic::Ordering::SeqCst);

        let position = get_position_with_retry(&venue, "BTCUSDC").await.unwrap();
        assert!(position.is_flat());
    }

    #[tokio::test]
    async fn test_position_retry_exhaustion_is_fatal() {
        let venue = MockVenue::new();
        venue
            .position_failures
            .store(POSITION_POLL_ATTEMPTS + 5, std::sync::atomic::Ordering::SeqCst);

        let err = get_position_with_retry(&venue, "BTCUSDC").await.unwrap_err();
        assert_eq!(err.kind, VenueErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_stop_market_shape() {
        let venue = MockVenue::new();
        venue
            .place_stop_market_close("BTCUSDC", OrderSide::Sell, 95_000.0)
            .await
            .unwrap();

        let placements = venue.placements.lock().await;
        assert_eq!(placements.len(), 1);
        let stop = &placements[0];
        assert_eq!(stop.order_type, "STOP_MARKET");
        assert!(stop.close_position);
        assert!(!stop.reduce_only);
        assert_eq!(stop.qty, 0.0);
    }
}
