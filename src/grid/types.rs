//! Core data types for the grid-martingale engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side as sent to the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to the venue's side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Which sides of the ladder are armed for entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    /// Whether entries on `side` are allowed under this direction
    pub fn arms(&self, side: PositionSide) -> bool {
        match (self, side) {
            (_, PositionSide::Flat) => false,
            (TradeDirection::Both, _) => true,
            (TradeDirection::Long, PositionSide::Long) => true,
            (TradeDirection::Short, PositionSide::Short) => true,
            _ => false,
        }
    }

    /// The single armed side, if the direction is one-sided
    pub fn sole_side(&self) -> Option<PositionSide> {
        match self {
            TradeDirection::Long => Some(PositionSide::Long),
            TradeDirection::Short => Some(PositionSide::Short),
            TradeDirection::Both => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Some(TradeDirection::Long),
            "SHORT" => Some(TradeDirection::Short),
            "BOTH" => Some(TradeDirection::Both),
            _ => None,
        }
    }
}

/// Current position side; `Flat` means no open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

impl PositionSide {
    /// Side of an order that opens or adds to this position
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Short => OrderSide::Sell,
            _ => OrderSide::Buy,
        }
    }

    /// Side of an order that closes this position
    pub fn close_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, PositionSide::Flat)
    }
}

/// Logical slot an order occupies in the desired-order set
///
/// Entry levels are 1-based to match the ladder numbering and carry the side
/// they open, since a flat ladder in `Both` mode arms entries on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSlot {
    Entry(PositionSide, u8),
    TakeProfit,
    BreakEven,
    StopLoss,
}

impl OrderSlot {
    pub fn is_entry(&self) -> bool {
        matches!(self, OrderSlot::Entry(..))
    }

    /// Entry level, if this is an entry slot
    pub fn entry_level(&self) -> Option<u8> {
        match self {
            OrderSlot::Entry(_, level) => Some(*level),
            _ => None,
        }
    }
}

/// One order the state machine wants resting at the venue
///
/// For `StopLoss` the venue closes the full position at trigger, so `qty`
/// is informational only and never sent.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredOrder {
    pub slot: OrderSlot,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
}

impl DesiredOrder {
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}

/// An order id handed back by the venue, tracked per slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub price: f64,
    pub qty: f64,
}

/// One entry fill that built up the current position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub level: u8,
    pub fill_price: f64,
    pub base_qty: f64,
    pub notional: f64,
}

/// Position as reported by the venue
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VenuePosition {
    pub side: PositionSide,
    pub qty: f64,
    pub avg_price: f64,
    pub unrealized_pnl: f64,
}

impl VenuePosition {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            qty: 0.0,
            avg_price: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side.is_flat() || self.qty <= 0.0
    }
}

/// Open order as reported by the venue
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub order_type: String,
    pub price: f64,
    pub stop_price: Option<f64>,
    pub qty: f64,
    pub reduce_only: bool,
}

/// A closed 1-minute bar from the kline stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlineClose {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
}

/// Which exit order closed (part of) the position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    BreakEven,
    StopLoss,
}

/// Journalled trade event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    Entry(u8),
    TakeProfit,
    PartialBreakEven,
    StopLoss,
    CancelAll,
}

impl TradeEvent {
    /// Journal label, e.g. `ENTRY_L2`
    pub fn label(&self) -> String {
        match self {
            TradeEvent::Entry(level) => format!("ENTRY_L{level}"),
            TradeEvent::TakeProfit => "TP".to_string(),
            TradeEvent::PartialBreakEven => "PARTIAL_BE".to_string(),
            TradeEvent::StopLoss => "SL".to_string(),
            TradeEvent::CancelAll => "CANCEL_ALL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_direction_arming() {
        assert!(TradeDirection::Long.arms(PositionSide::Long));
        assert!(!TradeDirection::Long.arms(PositionSide::Short));
        assert!(TradeDirection::Both.arms(PositionSide::Long));
        assert!(TradeDirection::Both.arms(PositionSide::Short));
        assert_eq!(TradeDirection::Short.sole_side(), Some(PositionSide::Short));
        assert_eq!(TradeDirection::Both.sole_side(), None);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(TradeDirection::parse("long"), Some(TradeDirection::Long));
        assert_eq!(TradeDirection::parse(" BOTH "), Some(TradeDirection::Both));
        assert_eq!(TradeDirection::parse("sideways"), None);
    }

    #[test]
    fn test_position_sides() {
        assert_eq!(PositionSide::Long.entry_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.close_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.entry_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.close_side(), OrderSide::Buy);
    }

    #[test]
    fn test_event_labels() {
        assert_eq!(TradeEvent::Entry(1).label(), "ENTRY_L1");
        assert_eq!(TradeEvent::Entry(4).label(), "ENTRY_L4");
        assert_eq!(TradeEvent::PartialBreakEven.label(), "PARTIAL_BE");
    }
}
