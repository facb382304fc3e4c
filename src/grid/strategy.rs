//! Pure decision core of the grid-martingale strategy
//!
//! Everything here is a function of (state, params, symbol spec) and returns
//! data. Venue I/O, journalling and persistence happen in the reconciler.

use crate::config::GridParams;
use crate::grid::errors::GridResult;
use crate::grid::ladder::{
    be_price, center_from_avg, entry_qty, ladder_prices, sl_price, tp_price, SymbolSpec,
};
use crate::grid::state::StrategyState;
use crate::grid::types::{DesiredOrder, ExitKind, OrderSlot, PositionSide};

/// Sides on which the flat ladder arms entries
pub fn armed_sides(params: &GridParams) -> Vec<PositionSide> {
    match params.trade_direction.sole_side() {
        Some(side) => vec![side],
        None => vec![PositionSide::Long, PositionSide::Short],
    }
}

/// Realized result of an exit transition, for journalling and audit
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    pub kind: ExitKind,
    pub exit_price: f64,
    pub closed_qty: f64,
    pub gross_pnl: f64,
    /// Exit fee plus the entry fees released by this close
    pub fees: f64,
    pub net_pnl: f64,
    pub new_center: f64,
}

fn gross_pnl(side: PositionSide, avg_price: f64, exit_price: f64, qty: f64) -> f64 {
    match side {
        PositionSide::Short => (avg_price - exit_price) * qty,
        _ => (exit_price - avg_price) * qty,
    }
}

/// Arm the grid on the first closed bar after start
pub fn arm_grid(state: &mut StrategyState, close_price: f64) {
    if state.grid_center.is_none() {
        state.grid_center = Some(close_price);
    }
}

/// Move the ladder reference while flat (range breach, unexpected flat)
pub fn recenter(state: &mut StrategyState, new_center: f64) {
    debug_assert!(!state.has_position());
    state.grid_center = Some(new_center);
}

/// Whether a flat-state close breaches the watch band on the
/// out-of-armed-direction side
pub fn range_breached(params: &GridParams, center: f64, last_close: f64) -> bool {
    let half = params.grid_range_pct / 2.0;
    let upward = last_close > center * (1.0 + half);
    let downward = last_close < center * (1.0 - half);
    match params.trade_direction.sole_side() {
        Some(PositionSide::Long) => upward,
        Some(PositionSide::Short) => downward,
        _ => upward || downward,
    }
}

/// Apply an entry fill at 1-based `level`.
///
/// Duplicate deliveries are no-ops: a level that is already part of the
/// position is left untouched and `false` is returned.
pub fn apply_entry_fill(
    state: &mut StrategyState,
    params: &GridParams,
    side: PositionSide,
    level: u8,
    fill_price: f64,
    fill_qty: f64,
) -> bool {
    if state.has_position() && state.position_side != side {
        return false;
    }
    if state.entries.iter().any(|e| e.level == level) {
        return false;
    }

    if !state.has_position() {
        state.position_side = side;
        state.start_grid_center = state.grid_center;
    }

    let fee = fill_price * fill_qty * params.maker_fee;
    state.add_entry(level, fill_price, fill_qty, fee);
    true
}

/// Overwrite average and size with the venue's authoritative values.
///
/// Returns `true` when local tracking diverged beyond tolerance.
pub fn adopt_venue_position(state: &mut StrategyState, venue_qty: f64, venue_avg: f64) -> bool {
    let qty_tol = (state.total_size * 1e-3).max(1e-9);
    let diverged = (state.total_size - venue_qty).abs() > qty_tol
        || (state.avg_price - venue_avg).abs() > venue_avg.abs() * 1e-4;

    let qty_scale = if state.total_size > 0.0 {
        venue_qty / state.total_size
    } else {
        1.0
    };
    for entry in &mut state.entries {
        entry.base_qty *= qty_scale;
    }

    // keep the weighted mean of the entries equal to the adopted average
    let derived_avg = if venue_qty > 0.0 {
        state
            .entries
            .iter()
            .map(|e| e.fill_price * e.base_qty)
            .sum::<f64>()
            / venue_qty
    } else {
        0.0
    };
    if derived_avg > 0.0 && venue_avg > 0.0 {
        let price_scale = venue_avg / derived_avg;
        for entry in &mut state.entries {
            entry.fill_price *= price_scale;
        }
    }
    for entry in &mut state.entries {
        entry.notional = entry.fill_price * entry.base_qty;
    }

    state.total_size = venue_qty;
    state.avg_price = venue_avg;
    if let Some(first) = state.entries.iter().find(|e| e.level == 1) {
        state.level1_qty = first.base_qty;
    }
    diverged
}

/// Full exit at `exit_price`; the ladder recenters onto it.
///
/// Limit exits (TP, and a BE that happened to flatten everything) pay maker,
/// the stop-market SL pays taker. Accrued entry fees are released in full.
pub fn apply_full_exit(
    state: &mut StrategyState,
    params: &GridParams,
    exit_price: f64,
    kind: ExitKind,
) -> ExitOutcome {
    let side = state.position_side;
    let closed_qty = state.total_size;
    let fee_rate = match kind {
        ExitKind::StopLoss => params.taker_fee,
        _ => params.maker_fee,
    };
    let gross = gross_pnl(side, state.avg_price, exit_price, closed_qty);
    let fees = exit_price * closed_qty * fee_rate + state.entry_fees;
    let net = gross - fees;

    state.capital += net;
    state.reset_position();
    state.grid_center = Some(exit_price);

    ExitOutcome {
        kind,
        exit_price,
        closed_qty,
        gross_pnl: gross,
        fees,
        net_pnl: net,
        new_center: exit_price,
    }
}

/// Full exit at the take-profit price
pub fn apply_take_profit(
    state: &mut StrategyState,
    params: &GridParams,
    exit_price: f64,
) -> ExitOutcome {
    apply_full_exit(state, params, exit_price, ExitKind::TakeProfit)
}

/// Full exit at the stop price
pub fn apply_stop_loss(
    state: &mut StrategyState,
    params: &GridParams,
    exit_price: f64,
) -> ExitOutcome {
    apply_full_exit(state, params, exit_price, ExitKind::StopLoss)
}

/// Partial exit at break-even: everything above the Level-1 stack closes, the
/// survivor becomes a fresh Level-1 position and the grid recenters so the
/// surviving average sits on Level 1.
///
/// `synced_qty`/`synced_avg` are the venue's post-fill position values, which
/// are authoritative for the surviving stack.
pub fn apply_partial_break_even(
    state: &mut StrategyState,
    params: &GridParams,
    exit_price: f64,
    synced_qty: f64,
    synced_avg: f64,
) -> ExitOutcome {
    let side = state.position_side;
    let total_before = state.total_size;
    let closed_qty = (total_before - synced_qty).max(0.0);
    let avg_before = state.avg_price;

    let gross = gross_pnl(side, avg_before, exit_price, closed_qty);
    let released_entry_fees = if total_before > 0.0 {
        state.entry_fees * closed_qty / total_before
    } else {
        0.0
    };
    let fees = exit_price * closed_qty * params.maker_fee + released_entry_fees;
    let net = gross - fees;

    state.capital += net;
    state.entry_fees -= released_entry_fees;

    state.entries.clear();
    state.total_size = 0.0;
    state.add_entry(1, synced_avg, synced_qty, 0.0);
    // add_entry only raises current_level; after a partial exit it must drop
    state.current_level = 1;
    state.level1_qty = synced_qty;

    let new_center = center_from_avg(params, synced_avg, side);
    state.grid_center = Some(new_center);

    ExitOutcome {
        kind: ExitKind::BreakEven,
        exit_price,
        closed_qty,
        gross_pnl: gross,
        fees,
        net_pnl: net,
        new_center,
    }
}

/// When the venue reports flat but the local state held a position, pick the
/// exit whose tracked price is closest to the last observed price.
pub fn infer_exit(state: &StrategyState, last_price: f64) -> Option<ExitKind> {
    let mut best: Option<(f64, ExitKind)> = None;
    let mut consider = |price: Option<f64>, kind: ExitKind| {
        if let Some(p) = price {
            let dist = (last_price - p).abs();
            if best.map(|(d, _)| dist < d).unwrap_or(true) {
                best = Some((dist, kind));
            }
        }
    };

    consider(
        state.orders.take_profit.as_ref().map(|o| o.price),
        ExitKind::TakeProfit,
    );
    consider(
        state.orders.break_even.as_ref().map(|o| o.price),
        ExitKind::BreakEven,
    );
    consider(
        state.orders.stop_loss.as_ref().map(|o| o.price),
        ExitKind::StopLoss,
    );

    // With no exit order tracked, a full close at level 1 can only be the TP
    // and at level N the SL; in between default to TP.
    best.map(|(_, kind)| kind).or({
        if state.has_position() {
            Some(ExitKind::TakeProfit)
        } else {
            None
        }
    })
}

/// The complete set of orders that should rest at the venue right now
///
/// Entries come first in ascending level order (bottom-up placement), the
/// close order next, the stop last. TP and BE never coexist; the SL appears
/// exactly when the deepest level is filled.
pub fn desired_orders(
    state: &StrategyState,
    params: &GridParams,
    spec: &SymbolSpec,
) -> GridResult<Vec<DesiredOrder>> {
    let Some(center) = state.grid_center else {
        return Ok(Vec::new());
    };
    let max_level = params.max_entry_level;
    let mut out = Vec::new();

    if !state.has_position() {
        for side in armed_sides(params) {
            let prices = ladder_prices(spec, params, center, side)?;
            for (idx, price) in prices.iter().enumerate() {
                let level = idx as u8 + 1;
                let qty = entry_qty(spec, params, state.capital, side, level, *price);
                if qty > 0.0 {
                    out.push(DesiredOrder {
                        slot: OrderSlot::Entry(side, level),
                        side: side.entry_side(),
                        price: *price,
                        qty,
                    });
                }
            }
        }
        return Ok(out);
    }

    let side = state.position_side;
    let prices = ladder_prices(spec, params, center, side)?;
    for level in (state.current_level + 1)..=max_level {
        let price = prices[level as usize - 1];
        let qty = entry_qty(spec, params, state.capital, side, level, price);
        if qty > 0.0 {
            out.push(DesiredOrder {
                slot: OrderSlot::Entry(side, level),
                side: side.entry_side(),
                price,
                qty,
            });
        }
    }

    if state.current_level == 1 {
        out.push(DesiredOrder {
            slot: OrderSlot::TakeProfit,
            side: side.close_side(),
            price: tp_price(spec, params, state.avg_price, side),
            qty: spec.truncate_qty(state.total_size),
        });
    } else {
        // a position above Level 1 must always carry its break-even close;
        // an excess below one step rounds up to a single step
        let mut close_qty = spec.truncate_qty(state.total_size - state.level1_qty);
        if close_qty <= 0.0 {
            close_qty = spec.qty_step.min(spec.truncate_qty(state.total_size));
        }
        if close_qty > 0.0 {
            out.push(DesiredOrder {
                slot: OrderSlot::BreakEven,
                side: side.close_side(),
                price: be_price(spec, params, state.avg_price, side),
                qty: close_qty,
            });
        }
        if state.current_level >= max_level {
            out.push(DesiredOrder {
                slot: OrderSlot::StopLoss,
                side: side.close_side(),
                price: sl_price(spec, params, center, side),
                qty: state.total_size,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ladder::SymbolSpec;
    use crate::grid::types::{OrderSide, TradeDirection, TrackedOrder};

    fn spec() -> SymbolSpec {
        SymbolSpec::new("BTCUSDC", 0.1, 0.00001)
    }

    fn params() -> GridParams {
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

    fn armed_state() -> StrategyState {
        let mut state = StrategyState::new(1000.0);
        arm_grid(&mut state, 100_000.0);
        state
    }

    #[test]
    fn test_first_bar_emits_full_ladder_only() {
        // B1: flat ladder = N entries, no TP/BE/SL
        let state = armed_state();
        let orders = desired_orders(&state, &params(), &spec()).unwrap();
        assert_eq!(orders.len(), 4);
        assert!(orders.iter().all(|o| o.slot.is_entry()));
        assert_eq!(orders[0].price, 99_500.0);
        assert_eq!(orders[3].price, 95_500.0);
        // bottom-up by level
        let levels: Vec<u8> = orders.iter().filter_map(|o| o.slot.entry_level()).collect();
        assert_eq!(levels, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_both_mode_arms_two_ladders() {
        let mut p = params();
        p.trade_direction = TradeDirection::Both;
        let state = armed_state();
        let orders = desired_orders(&state, &p, &spec()).unwrap();
        assert_eq!(orders.len(), 8);
        assert_eq!(orders.iter().filter(|o| o.side == OrderSide::Buy).count(), 4);
        assert_eq!(orders.iter().filter(|o| o.side == OrderSide::Sell).count(), 4);
    }

    #[test]
    fn test_level1_fill_swaps_to_tp() {
        let mut state = armed_state();
        let p = params();
        assert!(apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753));

        let orders = desired_orders(&state, &p, &spec()).unwrap();
        let entries: Vec<u8> = orders.iter().filter_map(|o| o.slot.entry_level()).collect();
        assert_eq!(entries, vec![2, 3, 4]);

        let tp = orders.iter().find(|o| o.slot == OrderSlot::TakeProfit).unwrap();
        assert_eq!(tp.side, OrderSide::Sell);
        assert_eq!(tp.price, 99_997.5);
        assert!((tp.qty - 0.00753).abs() < 1e-12);
        assert!(orders.iter().all(|o| o.slot != OrderSlot::BreakEven));
        assert!(orders.iter().all(|o| o.slot != OrderSlot::StopLoss));
    }

    #[test]
    fn test_duplicate_fill_is_noop() {
        let mut state = armed_state();
        let p = params();
        assert!(apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753));
        let snapshot = state.clone();
        assert!(!apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_level2_swaps_tp_for_be() {
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 2, 99_000.0, 0.03030);

        let orders = desired_orders(&state, &p, &spec()).unwrap();
        assert!(orders.iter().all(|o| o.slot != OrderSlot::TakeProfit));
        let be = orders.iter().find(|o| o.slot == OrderSlot::BreakEven).unwrap();
        assert!((be.qty - 0.03030).abs() < 1e-9);
        assert!(orders.iter().all(|o| o.slot != OrderSlot::StopLoss));
    }

    #[test]
    fn test_sub_step_excess_still_emits_be() {
        // a tiny level-2 ratio (or a coarse step) can leave less than one
        // step above the Level-1 stack; the BE close must exist regardless
        let coarse = SymbolSpec::new("BTCUSDC", 0.1, 0.001);
        let mut state = armed_state();
        let mut p = params();
        p.entry_ratios = vec![0.40, 0.0001, 0.25, 0.30];

        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.007);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 2, 99_000.0, 0.0004);

        let orders = desired_orders(&state, &p, &coarse).unwrap();
        let be = orders.iter().find(|o| o.slot == OrderSlot::BreakEven).unwrap();
        assert!((be.qty - 0.001).abs() < 1e-12);
        assert!(orders.iter().all(|o| o.slot != OrderSlot::TakeProfit));
    }

    #[test]
    fn test_level4_arms_stop_loss() {
        // I4: SL exists iff the deepest level is filled
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 2, 99_000.0, 0.03030);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 3, 96_000.0, 0.03906);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 4, 95_500.0, 0.07853);

        let orders = desired_orders(&state, &p, &spec()).unwrap();
        assert!(orders.iter().all(|o| !o.slot.is_entry()));
        let sl = orders.iter().find(|o| o.slot == OrderSlot::StopLoss).unwrap();
        assert_eq!(sl.price, 95_000.0);
        assert_eq!(sl.side, OrderSide::Sell);
        assert!(orders.iter().any(|o| o.slot == OrderSlot::BreakEven));
    }

    #[test]
    fn test_take_profit_scenario() {
        // S1: L1 fill then TP at avg * 1.005
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);

        let outcome = apply_take_profit(&mut state, &p, 99_997.5);
        assert!((outcome.gross_pnl - (99_997.5 - 99_500.0) * 0.00753).abs() < 1e-9);
        assert!((state.capital - (1000.0 + outcome.net_pnl)).abs() < 1e-9);
        assert!(!state.has_position());
        assert_eq!(state.grid_center, Some(99_997.5));
        assert!(state.validate().is_ok());

        // fresh full ladder off the new center
        let orders = desired_orders(&state, &p, &spec()).unwrap();
        assert_eq!(orders.len(), 4);
        assert!(orders.iter().all(|o| o.slot.is_entry()));
    }

    #[test]
    fn test_partial_break_even_scenario() {
        // S2: three levels filled, BE closes all but the Level-1 stack
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 2, 99_000.0, 0.03030);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 3, 96_000.0, 0.03906);

        let avg_before = state.avg_price;
        let total_before = state.total_size;
        let be_px = spec().floor_price(avg_before * 1.001);
        let capital_before = state.capital;

        let outcome =
            apply_partial_break_even(&mut state, &p, be_px, 0.00753, avg_before);

        assert!((outcome.closed_qty - (total_before - 0.00753)).abs() < 1e-9);
        assert!(outcome.net_pnl > 0.0);
        assert!((state.capital - capital_before - outcome.net_pnl).abs() < 1e-9);
        assert_eq!(state.current_level, 1);
        assert!((state.total_size - 0.00753).abs() < 1e-12);
        assert!((state.level1_qty - 0.00753).abs() < 1e-12);
        assert!(state.validate().is_ok());

        // new center puts the surviving average on Level 1
        let expected_center = avg_before / (1.0 - p.level_distance(1));
        assert!((outcome.new_center - expected_center).abs() < 1e-6);

        // desired set: L2..L4 entries plus a TP
        let orders = desired_orders(&state, &p, &spec()).unwrap();
        let levels: Vec<u8> = orders.iter().filter_map(|o| o.slot.entry_level()).collect();
        assert_eq!(levels, vec![2, 3, 4]);
        assert!(orders.iter().any(|o| o.slot == OrderSlot::TakeProfit));
        assert!(orders.iter().all(|o| o.slot != OrderSlot::BreakEven));
    }

    #[test]
    fn test_stop_loss_scenario() {
        // S3: four levels filled, SL fires at center * (1 - sl_distance)
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 2, 99_000.0, 0.03030);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 3, 96_000.0, 0.03906);
        apply_entry_fill(&mut state, &p, PositionSide::Long, 4, 95_500.0, 0.07853);

        let outcome = apply_stop_loss(&mut state, &p, 95_000.0);
        assert!(outcome.net_pnl < 0.0);
        assert!(state.capital < 1000.0);
        assert!(!state.has_position());
        assert_eq!(state.grid_center, Some(95_000.0));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_capital_identity_holds() {
        // I5 with non-zero fees on every leg
        let mut state = armed_state();
        let mut p = params();
        p.maker_fee = 0.0002;
        p.taker_fee = 0.0005;

        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        assert!(state.entry_fees > 0.0);

        let capital_before = state.capital;
        let outcome = apply_take_profit(&mut state, &p, 99_997.5);
        assert!(
            (state.capital - (capital_before + outcome.gross_pnl - outcome.fees)).abs() < 1e-9
        );
    }

    #[test]
    fn test_range_breach_directionality() {
        // S4/B2: LONG arms only the upward breach
        let p = params();
        assert!(range_breached(&p, 100_000.0, 102_100.0));
        assert!(!range_breached(&p, 100_000.0, 97_900.0));

        let mut short = p.clone();
        short.trade_direction = TradeDirection::Short;
        assert!(range_breached(&short, 100_000.0, 97_900.0));
        assert!(!range_breached(&short, 100_000.0, 102_100.0));

        let mut both = p;
        both.trade_direction = TradeDirection::Both;
        assert!(range_breached(&both, 100_000.0, 102_100.0));
        assert!(range_breached(&both, 100_000.0, 97_900.0));
        assert!(!range_breached(&both, 100_000.0, 100_500.0));
    }

    #[test]
    fn test_infer_exit_by_proximity() {
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);
        state.orders.set(
            OrderSlot::TakeProfit,
            TrackedOrder {
                order_id: "1".into(),
                price: 99_997.5,
                qty: 0.00753,
            },
        );
        state.orders.set(
            OrderSlot::StopLoss,
            TrackedOrder {
                order_id: "2".into(),
                price: 95_000.0,
                qty: 0.00753,
            },
        );

        assert_eq!(infer_exit(&state, 100_050.0), Some(ExitKind::TakeProfit));
        assert_eq!(infer_exit(&state, 94_900.0), Some(ExitKind::StopLoss));
    }

    #[test]
    fn test_adopt_venue_position_divergence() {
        let mut state = armed_state();
        let p = params();
        apply_entry_fill(&mut state, &p, PositionSide::Long, 1, 99_500.0, 0.00753);

        // within tolerance: no warning flag
        assert!(!adopt_venue_position(&mut state, 0.00753, 99_500.0));
        // venue reports materially less size
        assert!(adopt_venue_position(&mut state, 0.00700, 99_480.0));
        assert!((state.total_size - 0.00700).abs() < 1e-12);
        assert!((state.level1_qty - 0.00700).abs() < 1e-12);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_short_side_mirrors() {
        let mut state = armed_state();
        let mut p = params();
        p.trade_direction = TradeDirection::Short;

        apply_entry_fill(&mut state, &p, PositionSide::Short, 1, 100_500.0, 0.00746);
        let orders = desired_orders(&state, &p, &spec()).unwrap();
        let tp = orders.iter().find(|o| o.slot == OrderSlot::TakeProfit).unwrap();
        assert_eq!(tp.side, OrderSide::Buy);
        assert!(tp.price < 100_500.0);

        let outcome = apply_take_profit(&mut state, &p, tp.price);
        assert!(outcome.gross_pnl > 0.0);
    }
}
