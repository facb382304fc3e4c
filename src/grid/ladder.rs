//! Price-ladder math and venue rounding
//!
//! All prices the engine prints are aligned to the venue tick on the worse
//! side of the trade (down for LONG, up for SHORT) so a computed level is
//! always reachable. Quantities are truncated toward smaller size to avoid
//! reduce-only rejections.

use crate::config::GridParams;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::types::PositionSide;

/// A value within this many tick-counts of a boundary is treated as sitting
/// on it, absorbing float division error.
const SNAP_EPS: f64 = 1e-6;

fn snap_floor(units: f64) -> f64 {
    let nearest = units.round();
    if (units - nearest).abs() < SNAP_EPS {
        nearest
    } else {
        units.floor()
    }
}

fn snap_ceil(units: f64) -> f64 {
    let nearest = units.round();
    if (units - nearest).abs() < SNAP_EPS {
        nearest
    } else {
        units.ceil()
    }
}

/// Static per-symbol venue constraints
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    /// Venue identifier, e.g. `BTCUSDC`
    pub symbol: String,
    /// Smallest price increment
    pub price_tick: f64,
    /// Smallest quantity increment
    pub qty_step: f64,
}

impl SymbolSpec {
    pub fn new(symbol: impl Into<String>, price_tick: f64, qty_step: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price_tick,
            qty_step,
        }
    }

    /// Largest tick multiple not above `price`
    pub fn floor_price(&self, price: f64) -> f64 {
        snap_floor(price / self.price_tick) * self.price_tick
    }

    /// Smallest tick multiple not below `price`
    pub fn ceil_price(&self, price: f64) -> f64 {
        snap_ceil(price / self.price_tick) * self.price_tick
    }

    /// Round toward the worse side of a trade on `side`: entries and exits
    /// for a LONG print at or below the raw price, SHORT at or above.
    pub fn round_price(&self, price: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Short => self.ceil_price(price),
            _ => self.floor_price(price),
        }
    }

    /// Truncate a quantity toward smaller size
    pub fn truncate_qty(&self, qty: f64) -> f64 {
        snap_floor(qty / self.qty_step) * self.qty_step
    }
}

/// Raw (unrounded) distance-based price below/above the grid center
fn offset_price(center: f64, distance: f64, side: PositionSide) -> f64 {
    match side {
        PositionSide::Short => center * (1.0 + distance),
        _ => center * (1.0 - distance),
    }
}

/// Entry price of 1-based `level` on `side`, tick-aligned
pub fn level_price(
    spec: &SymbolSpec,
    params: &GridParams,
    center: f64,
    side: PositionSide,
    level: u8,
) -> f64 {
    spec.round_price(offset_price(center, params.level_distance(level), side), side)
}

/// Stop-loss trigger price on `side`, tick-aligned
pub fn sl_price(spec: &SymbolSpec, params: &GridParams, center: f64, side: PositionSide) -> f64 {
    spec.round_price(offset_price(center, params.sl_distance, side), side)
}

/// Take-profit price off the average entry
pub fn tp_price(spec: &SymbolSpec, params: &GridParams, avg_price: f64, side: PositionSide) -> f64 {
    let raw = match side {
        PositionSide::Short => avg_price * (1.0 - params.tp_pct),
        _ => avg_price * (1.0 + params.tp_pct),
    };
    spec.round_price(raw, side)
}

/// Break-even price off the average entry
pub fn be_price(spec: &SymbolSpec, params: &GridParams, avg_price: f64, side: PositionSide) -> f64 {
    let raw = match side {
        PositionSide::Short => avg_price * (1.0 - params.be_pct),
        _ => avg_price * (1.0 + params.be_pct),
    };
    spec.round_price(raw, side)
}

/// Entry quantity for 1-based `level`: `capital * ratio * leverage / price`,
/// truncated to the venue step.
pub fn entry_qty(
    spec: &SymbolSpec,
    params: &GridParams,
    capital: f64,
    side: PositionSide,
    level: u8,
    price: f64,
) -> f64 {
    let notional = capital * params.entry_ratio(level) * params.leverage_for(side) as f64;
    spec.truncate_qty(notional / price)
}

/// Grid center implied by an average price sitting on Level 1
///
/// Used by the partial break-even regrid: the surviving Level-1 stack keeps
/// its average as the new Level-1 price.
pub fn center_from_avg(params: &GridParams, avg_price: f64, side: PositionSide) -> f64 {
    match side {
        PositionSide::Short => avg_price / (1.0 + params.level_distance(1)),
        _ => avg_price / (1.0 - params.level_distance(1)),
    }
}

/// All entry prices for levels 1..=N, verifying monotonicity after rounding
///
/// Valid `level_distances` never collide on the tick grid; a collision means
/// the config and tick size are incompatible and the ladder must not print.
pub fn ladder_prices(
    spec: &SymbolSpec,
    params: &GridParams,
    center: f64,
    side: PositionSide,
) -> GridResult<Vec<f64>> {
    let prices: Vec<f64> = (1..=params.max_entry_level)
        .map(|level| level_price(spec, params, center, side, level))
        .collect();

    for pair in prices.windows(2) {
        let ordered = match side {
            PositionSide::Short => pair[0] < pair[1],
            _ => pair[0] > pair[1],
        };
        if !ordered {
            return Err(GridError::Ladder(format!(
                "ladder levels collide after tick rounding: {} vs {}",
                pair[0], pair[1]
            )));
        }
    }

    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::TradeDirection;

    pub(crate) fn btc_spec() -> SymbolSpec {
        SymbolSpec::new("BTCUSDC", 0.1, 0.00001)
    }

    pub(crate) fn sample_params() -> GridParams {
        GridParams {
            initial_capital: 1000.0,
            leverage_long: 15,
            leverage_short: 15,
            trade_direction: TradeDirection::Long,
            grid_range_pct: 0.04,
            max_entry_level: 4,
            entry_ratios: vec![0.05, 0.20, 0.25, 0.50],
            level_distances: vec![0.005, 0.010, 0.040, 0.045],
            sl_distance: 0.05,
            tp_pct: 0.005,
            be_pct: 0.001,
            maker_fee: 0.0,
            taker_fee: 0.000275,
        }
    }

    #[test]
    fn test_long_ladder_prices() {
        let spec = btc_spec();
        let params = sample_params();
        let prices = ladder_prices(&spec, &params, 100_000.0, PositionSide::Long).unwrap();
        assert_eq!(prices, vec![99_500.0, 99_000.0, 96_000.0, 95_500.0]);
        assert_eq!(sl_price(&spec, &params, 100_000.0, PositionSide::Long), 95_000.0);
    }

    #[test]
    fn test_short_ladder_mirrors() {
        let spec = btc_spec();
        let params = sample_params();
        let prices = ladder_prices(&spec, &params, 100_000.0, PositionSide::Short).unwrap();
        assert_eq!(prices, vec![100_500.0, 101_000.0, 104_000.0, 104_500.0]);
        assert_eq!(sl_price(&spec, &params, 100_000.0, PositionSide::Short), 105_000.0);
    }

    #[test]
    fn test_rounding_direction() {
        let spec = SymbolSpec::new("X", 0.5, 0.001);
        // 99.9 * anything lands off-grid; LONG rounds down, SHORT rounds up
        assert_eq!(spec.round_price(100.3, PositionSide::Long), 100.0);
        assert_eq!(spec.round_price(100.3, PositionSide::Short), 100.5);
        // exact multiples stay put
        assert_eq!(spec.round_price(100.5, PositionSide::Long), 100.5);
        assert_eq!(spec.round_price(100.5, PositionSide::Short), 100.5);
    }

    #[test]
    fn test_qty_truncation() {
        let spec = btc_spec();
        let params = sample_params();
        // 1000 * 0.05 * 15 / 99500 = 0.0075376...
        let qty = entry_qty(&spec, &params, 1000.0, PositionSide::Long, 1, 99_500.0);
        assert!((qty - 0.00753).abs() < 1e-12);
    }

    #[test]
    fn test_tp_be_prices() {
        let spec = btc_spec();
        let params = sample_params();
        assert_eq!(tp_price(&spec, &params, 99_500.0, PositionSide::Long), 99_997.5);
        assert!((be_price(&spec, &params, 99_500.0, PositionSide::Long) - 99_599.5).abs() < 1e-9);
    }

    #[test]
    fn test_center_from_avg_round_trips_level1() {
        let params = sample_params();
        let center = 100_000.0;
        let level1 = center * (1.0 - params.level_distance(1));
        let recovered = center_from_avg(&params, level1, PositionSide::Long);
        assert!((recovered - center).abs() < 1e-6);
    }

    #[test]
    fn test_collision_detected() {
        let spec = SymbolSpec::new("X", 10.0, 0.001);
        let mut params = sample_params();
        // distances 0.0001 apart collapse onto the same 10-unit tick at 100
        params.level_distances = vec![0.0001, 0.0002, 0.0003, 0.0004];
        params.sl_distance = 0.05;
        let err = ladder_prices(&spec, &params, 100.0, PositionSide::Long);
        assert!(err.is_err());
    }
}
