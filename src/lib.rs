#![deny(unreachable_pub)]

//! Live execution engine for an unequal-spacing grid-martingale strategy on
//! a single crypto perpetual-futures venue. One process per symbol.

pub mod config;
pub mod grid;
pub mod journal;
pub mod venue;

pub use config::{ConfigWatcher, GridParams};
pub use grid::{
    GridError, GridResult, GridRunner, KlineClose, Reconciler, RunnerConfig, StateStore,
    StrategyState, SymbolSpec, TradeDirection, VenueExecutor,
};
pub use journal::TradeJournal;
