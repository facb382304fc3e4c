//! Strategy state snapshot and crash-safe persistence

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::grid::errors::{GridError, GridResult};
use crate::grid::types::{EntryRecord, OrderSlot, PositionSide, TrackedOrder};

/// Bump when the snapshot layout changes; load refuses other versions so the
/// operator can migrate explicitly.
pub const STATE_VERSION: u32 = 1;

/// One tracked entry order together with the ladder slot it fills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySlot {
    pub side: PositionSide,
    pub level: u8,
    pub order: TrackedOrder,
}

/// Venue order ids the engine currently intends to hold, keyed by slot
///
/// Entry orders are kept sorted by (side, level) so serialization is stable
/// and a load-save cycle is byte-identical.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub entries: Vec<EntrySlot>,
    pub take_profit: Option<TrackedOrder>,
    pub break_even: Option<TrackedOrder>,
    pub stop_loss: Option<TrackedOrder>,
}

fn entry_rank(side: PositionSide, level: u8) -> (u8, u8) {
    let side_rank = match side {
        PositionSide::Long => 0,
        PositionSide::Short => 1,
        PositionSide::Flat => 2,
    };
    (side_rank, level)
}

impl OrderBook {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.take_profit = None;
        self.break_even = None;
        self.stop_loss = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.take_profit.is_none()
            && self.break_even.is_none()
            && self.stop_loss.is_none()
    }

    pub fn get(&self, slot: OrderSlot) -> Option<&TrackedOrder> {
        match slot {
            OrderSlot::Entry(side, level) => self
                .entries
                .iter()
                .find(|e| e.side == side && e.level == level)
                .map(|e| &e.order),
            OrderSlot::TakeProfit => self.take_profit.as_ref(),
            OrderSlot::BreakEven => self.break_even.as_ref(),
            OrderSlot::StopLoss => self.stop_loss.as_ref(),
        }
    }

    pub fn set(&mut self, slot: OrderSlot, order: TrackedOrder) {
        match slot {
            OrderSlot::Entry(side, level) => {
                self.entries.retain(|e| !(e.side == side && e.level == level));
                self.entries.push(EntrySlot { side, level, order });
                self.entries
                    .sort_by_key(|e| entry_rank(e.side, e.level));
            }
            OrderSlot::TakeProfit => self.take_profit = Some(order),
            OrderSlot::BreakEven => self.break_even = Some(order),
            OrderSlot::StopLoss => self.stop_loss = Some(order),
        }
    }

    pub fn remove(&mut self, slot: OrderSlot) -> Option<TrackedOrder> {
        match slot {
            OrderSlot::Entry(side, level) => {
                let idx = self
                    .entries
                    .iter()
                    .position(|e| e.side == side && e.level == level)?;
                Some(self.entries.remove(idx).order)
            }
            OrderSlot::TakeProfit => self.take_profit.take(),
            OrderSlot::BreakEven => self.break_even.take(),
            OrderSlot::StopLoss => self.stop_loss.take(),
        }
    }

    /// Every (slot, order) pair currently tracked, entries first in level order
    pub fn iter(&self) -> Vec<(OrderSlot, &TrackedOrder)> {
        let mut out: Vec<(OrderSlot, &TrackedOrder)> = self
            .entries
            .iter()
            .map(|e| (OrderSlot::Entry(e.side, e.level), &e.order))
            .collect();
        if let Some(o) = &self.take_profit {
            out.push((OrderSlot::TakeProfit, o));
        }
        if let Some(o) = &self.break_even {
            out.push((OrderSlot::BreakEven, o));
        }
        if let Some(o) = &self.stop_loss {
            out.push((OrderSlot::StopLoss, o));
        }
        out
    }

    /// Drop tracked orders whose id the venue no longer reports.
    ///
    /// Returns the slots that went away, entries in ascending level order,
    /// which is exactly the order missed fills must be replayed in.
    pub fn drop_unknown_ids(&mut self, known: &[String]) -> Vec<(OrderSlot, TrackedOrder)> {
        let gone: Vec<OrderSlot> = self
            .iter()
            .into_iter()
            .filter(|(_, o)| !known.contains(&o.order_id))
            .map(|(slot, _)| slot)
            .collect();

        gone.into_iter()
            .filter_map(|slot| self.remove(slot).map(|o| (slot, o)))
            .collect()
    }
}

/// Full strategy state persisted per symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub version: u32,
    /// Reference price of the ladder; `None` until the first bar closes
    pub grid_center: Option<f64>,
    /// Grid center at the moment the current position opened
    pub start_grid_center: Option<f64>,
    pub position_side: PositionSide,
    /// Highest filled level; 0 means flat
    pub current_level: u8,
    pub entries: Vec<EntryRecord>,
    pub avg_price: f64,
    pub total_size: f64,
    /// Level-1 fill quantity, preserved across partial exits
    pub level1_qty: f64,
    /// Quote fees accrued by the current position's entries
    pub entry_fees: f64,
    /// Running operational capital in quote currency
    pub capital: f64,
    pub orders: OrderBook,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StrategyState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            version: STATE_VERSION,
            grid_center: None,
            start_grid_center: None,
            position_side: PositionSide::Flat,
            current_level: 0,
            entries: Vec::new(),
            avg_price: 0.0,
            total_size: 0.0,
            level1_qty: 0.0,
            entry_fees: 0.0,
            capital: initial_capital,
            orders: OrderBook::default(),
            last_synced_at: None,
        }
    }

    pub fn has_position(&self) -> bool {
        !self.position_side.is_flat() && self.total_size > 0.0
    }

    /// Record an entry fill and recompute the weighted average
    pub fn add_entry(&mut self, level: u8, fill_price: f64, base_qty: f64, fee: f64) {
        self.entries.push(EntryRecord {
            level,
            fill_price,
            base_qty,
            notional: fill_price * base_qty,
        });
        self.total_size += base_qty;
        self.entry_fees += fee;
        if level == 1 {
            self.level1_qty = base_qty;
        }
        self.current_level = self.current_level.max(level);
        self.recompute_avg();
    }

    fn recompute_avg(&mut self) {
        if self.total_size <= 0.0 {
            self.avg_price = 0.0;
            return;
        }
        let value: f64 = self.entries.iter().map(|e| e.fill_price * e.base_qty).sum();
        self.avg_price = value / self.total_size;
    }

    /// Forget the position entirely; capital and grid center are untouched
    pub fn reset_position(&mut self) {
        self.position_side = PositionSide::Flat;
        self.current_level = 0;
        self.entries.clear();
        self.avg_price = 0.0;
        self.total_size = 0.0;
        self.level1_qty = 0.0;
        self.entry_fees = 0.0;
        self.start_grid_center = None;
    }

    /// Structural invariants that must hold after every reconciliation
    pub fn validate(&self) -> GridResult<()> {
        let flat = self.position_side.is_flat();
        if flat != (self.current_level == 0)
            || flat != self.entries.is_empty()
            || flat != (self.total_size <= 0.0)
        {
            return Err(GridError::StateCorrupt(format!(
                "flat-state mismatch: side={:?} level={} entries={} size={}",
                self.position_side,
                self.current_level,
                self.entries.len(),
                self.total_size
            )));
        }
        if self.current_level as usize != self.entries.len() {
            return Err(GridError::StateCorrupt(format!(
                "current_level {} != entries {}",
                self.current_level,
                self.entries.len()
            )));
        }
        if self.has_position() {
            let value: f64 = self.entries.iter().map(|e| e.fill_price * e.base_qty).sum();
            let expected = value / self.total_size;
            if (self.avg_price - expected).abs() > expected.abs() * 1e-6 {
                return Err(GridError::StateCorrupt(format!(
                    "avg_price {} diverges from entries ({})",
                    self.avg_price, expected
                )));
            }
            if self.orders.take_profit.is_some() && self.orders.break_even.is_some() {
                return Err(GridError::StateCorrupt(
                    "TP and BE tracked simultaneously".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Atomic-rename persistence for one symbol's [`StrategyState`]
///
/// Single writer per symbol process, so no locking. A crash leaves either the
/// old file or the new file, never a torn write.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot if one exists.
    ///
    /// A missing file means a fresh start; an unreadable or unparseable file
    /// is fatal so the operator inspects instead of silently resetting.
    pub fn load(&self) -> GridResult<Option<StrategyState>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GridError::StateCorrupt(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let state: StrategyState = serde_json::from_str(&text).map_err(|e| {
            GridError::StateCorrupt(format!("{}: {}", self.path.display(), e))
        })?;

        if state.version != STATE_VERSION {
            return Err(GridError::StateCorrupt(format!(
                "snapshot version {} unsupported (expected {})",
                state.version, STATE_VERSION
            )));
        }

        info!(
            "loaded state snapshot: side={:?} level={} capital={:.2}",
            state.position_side, state.current_level, state.capital
        );
        Ok(Some(state))
    }

    /// Serialize to a temp file, fsync, rename over the destination.
    pub fn save(&self, state: &StrategyState) -> GridResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GridError::StatePersistence(e.to_string()))?;

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
