//! Order-and-position reconciler
//!
//! One tick observes the venue, advances the pure state machine off what it
//! sees, then diffs the desired-order set against the venue and applies it.
//! Cancels always precede placements, entries go out bottom-up, and the stop
//! is placed only after the break-even close. A failed tick never persists.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::config::GridParams;
use crate::grid::errors::GridResult;
use crate::grid::executor::{
    get_position_with_retry, place_close_with_shrink, place_entry_with_shrink, with_backoff,
    ShrinkPlacement, VenueExecutor,
};
use crate::grid::ladder::{self, SymbolSpec};
use crate::grid::state::{StateStore, StrategyState};
use crate::grid::strategy;
use crate::grid::types::{
    DesiredOrder, ExitKind, KlineClose, OrderSlot, TradeEvent, TrackedOrder, VenueOrder,
};
use crate::journal::{JournalEntry, TradeJournal};

pub struct Reconciler<E: VenueExecutor> {
    spec: SymbolSpec,
    venue: Arc<E>,
    store: StateStore,
    journal: TradeJournal,
    state: StrategyState,
    /// Last observed close, used to infer which exit fired
    last_price: f64,
}

impl<E: VenueExecutor> Reconciler<E> {
    pub fn new(
        spec: SymbolSpec,
        venue: Arc<E>,
        store: StateStore,
        journal: TradeJournal,
        state: StrategyState,
    ) -> Self {
        let last_price = state.grid_center.unwrap_or(0.0);
        Self {
            spec,
            venue,
            store,
            journal,
            state,
            last_price,
        }
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    /// Persist the current state outside a tick (shutdown path)
    pub fn persist(&self) -> GridResult<()> {
        self.store.save(&self.state)
    }

    /// One-time venue setup: isolated margin mode.
    ///
    /// Leverage is applied per entry placement with the side's own value, so
    /// the venue's configured leverage always matches the sizing math.
    pub async fn prepare_venue(&self, _params: &GridParams) -> GridResult<()> {
        self.venue
            .set_margin_mode_isolated(&self.spec.symbol)
            .await?;
        Ok(())
    }

    /// Market-tick entry point: arm the grid on the first close, handle the
    /// flat-state range breach, then reconcile.
    pub async fn on_kline_close(
        &mut self,
        params: &GridParams,
        bar: &KlineClose,
    ) -> GridResult<()> {
        self.last_price = bar.close;

        if self.state.grid_center.is_none() {
            strategy::arm_grid(&mut self.state, bar.close);
            info!(
                "grid armed on first closed bar: center={:.2}",
                bar.close
            );
        } else if !self.state.has_position() {
            let center = self.state.grid_center.unwrap_or(bar.close);
            if strategy::range_breached(params, center, bar.close) {
                info!(
                    "flat-state range breach: close={:.2} center={:.2}, regridding",
                    bar.close, center
                );
                self.venue
                    .cancel_all_open_orders(&self.spec.symbol)
                    .await?;
                self.state.orders.clear();
                strategy::recenter(&mut self.state, bar.close);
                self.journal.record_best_effort(&JournalEntry {
                    event: TradeEvent::CancelAll,
                    level: 0,
                    price: bar.close,
                    qty: 0.0,
                    realized_pnl: 0.0,
                    capital: self.state.capital,
                    grid_center: self.state.grid_center,
                    start_grid_center: self.state.start_grid_center,
                });
            }
        }

        self.reconcile(params).await
    }

    /// Heartbeat entry point: reconcile without a market event
    pub async fn heartbeat(&mut self, params: &GridParams) -> GridResult<()> {
        self.reconcile(params).await
    }

    /// One serialized reconciliation pass
    pub async fn reconcile(&mut self, params: &GridParams) -> GridResult<()> {
        let symbol = self.spec.symbol.clone();

        let position = get_position_with_retry(self.venue.as_ref(), &symbol).await?;
        let mut venue_open = self.venue.get_open_orders(&symbol).await?;
        let known_ids: Vec<String> = venue_open.iter().map(|o| o.order_id.clone()).collect();

        // Scratch copy: a failed tick leaves `self.state` untouched.
        let mut next = self.state.clone();
        let mut rows: Vec<JournalEntry> = Vec::new();

        if next.has_position() && position.is_flat() {
            self.handle_full_exit(params, &mut next, &mut rows).await?;
            venue_open.clear();
        } else if !position.is_flat() {
            self.handle_position_sync(params, &mut next, &mut rows, &position, &known_ids)
                .await?;
            // a BE fill cancels everything venue-side
            if rows.iter().any(|r| r.event == TradeEvent::PartialBreakEven) {
                venue_open.clear();
            }
        } else {
            // flat on both sides; forget ids the venue no longer reports
            let _ = next.orders.drop_unknown_ids(&known_ids);
        }

        let desired = strategy::desired_orders(&next, params, &self.spec)?;
        self.cancel_extraneous(&mut next, &desired, &venue_open)
            .await?;
        self.place_missing(params, &mut next, &desired).await?;

        next.last_synced_at = Some(Utc::now());
        next.validate()?;

        for row in &rows {
            self.journal.record_best_effort(row);
        }
        self.store.save(&next)?;
        self.state = next;
        Ok(())
    }

    /// Local position, venue flat: infer which exit fired and replay it
    async fn handle_full_exit(
        &self,
        params: &GridParams,
        next: &mut StrategyState,
        rows: &mut Vec<JournalEntry>,
    ) -> GridResult<()> {
        let side = next.position_side;
        let level = next.current_level;
        let start_center = next.start_grid_center;
        let kind = strategy::infer_exit(next, self.last_price).unwrap_or(ExitKind::TakeProfit);

        let exit_price = match kind {
            ExitKind::TakeProfit => next
                .orders
                .take_profit
                .as_ref()
                .map(|o| o.price)
                .unwrap_or_else(|| ladder::tp_price(&self.spec, params, next.avg_price, side)),
            ExitKind::BreakEven => next
                .orders
                .break_even
                .as_ref()
                .map(|o| o.price)
                .unwrap_or_else(|| ladder::be_price(&self.spec, params, next.avg_price, side)),
            ExitKind::StopLoss => next.orders.stop_loss.as_ref().map(|o| o.price).unwrap_or_else(
                || {
                    let center = next.grid_center.unwrap_or(next.avg_price);
                    ladder::sl_price(&self.spec, params, center, side)
                },
            ),
        };

        if kind == ExitKind::BreakEven {
            // a break-even should leave the Level-1 stack; a flat venue means
            // everything went, adopt that as the truth
            warn!("venue flat after BE fill; treating as full exit at {exit_price:.2}");
        }

        let outcome = strategy::apply_full_exit(next, params, exit_price, kind);
        info!(
            "{:?} exit detected: price={:.2} qty={:.6} net_pnl={:.4} capital={:.2}",
            kind, outcome.exit_price, outcome.closed_qty, outcome.net_pnl, next.capital
        );

        rows.push(JournalEntry {
            event: match kind {
                ExitKind::TakeProfit => TradeEvent::TakeProfit,
                ExitKind::BreakEven => TradeEvent::PartialBreakEven,
                ExitKind::StopLoss => TradeEvent::StopLoss,
            },
            level,
            price: outcome.exit_price,
            qty: outcome.closed_qty,
            realized_pnl: outcome.net_pnl,
            capital: next.capital,
            grid_center: next.grid_center,
            start_grid_center: start_center,
        });

        next.orders.clear();
        self.venue.cancel_all_open_orders(&self.spec.symbol).await?;
        Ok(())
    }

    /// Venue has a position: detect a BE partial exit, replay missed entry
    /// fills bottom-up, then adopt the venue's qty/avg as authoritative.
    async fn handle_position_sync(
        &self,
        params: &GridParams,
        next: &mut StrategyState,
        rows: &mut Vec<JournalEntry>,
        position: &crate::grid::types::VenuePosition,
        known_ids: &[String],
    ) -> GridResult<()> {
        let be_tracked = next.orders.break_even.clone();
        let be_gone = be_tracked
            .as_ref()
            .map(|o| !known_ids.contains(&o.order_id))
            .unwrap_or(false);

        if next.has_position()
            && be_gone
            && position.qty < next.total_size - self.spec.qty_step * 0.5
        {
            let be_order = be_tracked.expect("checked above");
            let level = next.current_level;

            if (position.qty - next.level1_qty).abs() > next.level1_qty.abs() * 1e-3 {
                warn!(
                    "post-BE position {:.6} deviates from Level-1 qty {:.6}; adopting venue values",
                    position.qty, next.level1_qty
                );
            }

            let outcome = strategy::apply_partial_break_even(
                next,
                params,
                be_order.price,
                position.qty,
                position.avg_price,
            );
            info!(
                "BE exit detected: price={:.2} closed={:.6} net_pnl={:.4} new_center={:.2}",
                outcome.exit_price, outcome.closed_qty, outcome.net_pnl, outcome.new_center
            );

            rows.push(JournalEntry {
                event: TradeEvent::PartialBreakEven,
                level,
                price: outcome.exit_price,
                qty: outcome.closed_qty,
                realized_pnl: outcome.net_pnl,
                capital: next.capital,
                grid_center: next.grid_center,
                start_grid_center: next.start_grid_center,
            });

            next.orders.clear();
            self.venue.cancel_all_open_orders(&self.spec.symbol).await?;
            return Ok(());
        }

        // Entry orders whose id vanished have filled, provided the venue size
        // accounts for them. Replay in ascending level order.
        let gone = next.orders.drop_unknown_ids(known_ids);
        for (slot, order) in gone {
            if let OrderSlot::Entry(side, level) = slot {
                if side == position.side
                    && next.total_size + order.qty <= position.qty + self.spec.qty_step
                    && strategy::apply_entry_fill(
                        next, params, side, level, order.price, order.qty,
                    )
                {
                    info!(
                        "entry fill detected: L{} price={:.2} qty={:.6}",
                        level, order.price, order.qty
                    );
                    rows.push(JournalEntry {
                        event: TradeEvent::Entry(level),
                        level,
                        price: order.price,
                        qty: order.qty,
                        realized_pnl: 0.0,
                        capital: next.capital,
                        grid_center: next.grid_center,
                        start_grid_center: next.start_grid_center,
                    });
                }
            }
        }

        if next.has_position() {
            if strategy::adopt_venue_position(next, position.qty, position.avg_price) {
                warn!(
                    "position mismatch resolved from venue: qty={:.6} avg={:.2}",
                    position.qty, position.avg_price
                );
            }
        } else {
            // nothing local explains the venue position; adopt it wholesale
            warn!(
                "venue holds an untracked {:?} position ({:.6} @ {:.2}); adopting as Level 1",
                position.side, position.qty, position.avg_price
            );
            strategy::apply_entry_fill(
                next,
                params,
                position.side,
                1,
                position.avg_price,
                position.qty,
            );
            rows.push(JournalEntry {
                event: TradeEvent::Entry(1),
                level: 1,
                price: position.avg_price,
                qty: position.qty,
                realized_pnl: 0.0,
                capital: next.capital,
                grid_center: next.grid_center,
                start_grid_center: next.start_grid_center,
            });
        }

        Ok(())
    }

    /// Whether a resting venue order still satisfies the desired order
    fn order_matches(&self, desired: &DesiredOrder, resting: &VenueOrder) -> bool {
        if desired.side != resting.side {
            return false;
        }
        let price_tol = self.spec.price_tick * 0.5;
        let resting_price = match desired.slot {
            OrderSlot::StopLoss => resting.stop_price.unwrap_or(resting.price),
            _ => resting.price,
        };
        if (desired.price - resting_price).abs() > price_tol {
            return false;
        }
        match desired.slot {
            // entry qty may have been margin-shrunk; don't churn on size
            OrderSlot::Entry(..) | OrderSlot::StopLoss => true,
            _ => (desired.qty - resting.qty).abs() <= self.spec.qty_step,
        }
    }

    /// Cancel venue orders with no matching desired slot (or a stale price)
    async fn cancel_extraneous(
        &self,
        next: &mut StrategyState,
        desired: &[DesiredOrder],
        venue_open: &[VenueOrder],
    ) -> GridResult<()> {
        let id_to_slot: HashMap<String, OrderSlot> = next
            .orders
            .iter()
            .into_iter()
            .map(|(slot, o)| (o.order_id.clone(), slot))
            .collect();

        for resting in venue_open {
            let keep = id_to_slot
                .get(&resting.order_id)
                .and_then(|slot| desired.iter().find(|d| d.slot == *slot))
                .map(|d| self.order_matches(d, resting))
                .unwrap_or(false);

            if !keep {
                info!(
                    "cancelling stale order {} ({} @ {:.2})",
                    resting.order_id, resting.order_type, resting.price
                );
                with_backoff(|| self.venue.cancel_order(&self.spec.symbol, &resting.order_id))
                    .await?;
                if let Some(slot) = id_to_slot.get(&resting.order_id) {
                    next.orders.remove(*slot);
                }
            }
        }
        Ok(())
    }

    /// Place desired orders with no tracked counterpart.
    ///
    /// `desired` arrives entries-first in ascending level order, the close
    /// next and the stop last, so iterating in order satisfies the intra-tick
    /// ordering guarantees.
    async fn place_missing(
        &self,
        params: &GridParams,
        next: &mut StrategyState,
        desired: &[DesiredOrder],
    ) -> GridResult<()> {
        for d in desired {
            if next.orders.get(d.slot).is_some() {
                continue;
            }

            match d.slot {
                OrderSlot::Entry(side, level) => {
                    // the venue holds one leverage setting; align it with the
                    // side being sized before the order goes out
                    with_backoff(|| {
                        self.venue
                            .set_leverage(&self.spec.symbol, params.leverage_for(side))
                    })
                    .await?;
                    match place_entry_with_shrink(
                        self.venue.as_ref(),
                        &self.spec,
                        d.side,
                        d.price,
                        d.qty,
                    )
                    .await?
                    {
                        ShrinkPlacement::Placed { order_id, qty } => {
                            info!(
                                "entry L{} placed: {} {:.6} @ {:.2} (notional {:.2})",
                                level,
                                d.side.as_str(),
                                qty,
                                d.price,
                                d.price * qty
                            );
                            next.orders.set(
                                d.slot,
                                TrackedOrder {
                                    order_id,
                                    price: d.price,
                                    qty,
                                },
                            );
                        }
                        ShrinkPlacement::Skipped => {
                            warn!("entry L{} skipped at margin floor", level);
                        }
                    }
                }
                OrderSlot::TakeProfit | OrderSlot::BreakEven => {
                    match place_close_with_shrink(
                        self.venue.as_ref(),
                        &self.spec,
                        d.side,
                        d.price,
                        d.qty,
                    )
                    .await?
                    {
                        ShrinkPlacement::Placed { order_id, qty } => {
                            info!(
                                "{:?} placed: {} {:.6} @ {:.2}",
                                d.slot,
                                d.side.as_str(),
                                qty,
                                d.price
                            );
                            next.orders.set(
                                d.slot,
                                TrackedOrder {
                                    order_id,
                                    price: d.price,
                                    qty,
                                },
                            );
                        }
                        ShrinkPlacement::Skipped => {
                            warn!("{:?} close skipped at reduce-only floor", d.slot);
                        }
                    }
                }
                OrderSlot::StopLoss => {
                    let order_id = with_backoff(|| {
                        self.venue
                            .place_stop_market_close(&self.spec.symbol, d.side, d.price)
                    })
                    .await?;
                    info!("SL placed: {} stop @ {:.2}", d.side.as_str(), d.price);
                    next.orders.set(
                        d.slot,
                        TrackedOrder {
                            order_id,
                            price: d.price,
                            qty: d.qty,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}
