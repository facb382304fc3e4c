//! Hot-reloadable strategy parameters
//!
//! Parameters live in a `KEY=VALUE` text file per symbol. The watcher re-reads
//! the file at a fixed cadence and hands out immutable snapshots; on any parse
//! or validation error the previous good snapshot is retained.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::types::{PositionSide, TradeDirection};

/// Keys the loader understands; anything else logs a warning and is ignored.
const KNOWN_KEYS: &[&str] = &[
    "INITIAL_CAPITAL",
    "LEVERAGE_LONG",
    "LEVERAGE_SHORT",
    "TRADE_DIRECTION",
    "GRID_RANGE_PCT",
    "MAX_ENTRY_LEVEL",
    "ENTRY_RATIOS",
    "LEVEL_DISTANCES",
    "SL_DISTANCE",
    "TP_PCT",
    "BE_PCT",
    "MAKER_FEE",
    "TAKER_FEE",
];

/// Validated strategy parameter snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct GridParams {
    pub initial_capital: f64,
    pub leverage_long: u32,
    pub leverage_short: u32,
    pub trade_direction: TradeDirection,
    /// Full width of the flat-state watch band; half-width is `pct / 2`
    pub grid_range_pct: f64,
    pub max_entry_level: u8,
    /// Fraction of capital committed per level, 1-based order
    pub entry_ratios: Vec<f64>,
    /// Distance of each level from `grid_center`, strictly increasing
    pub level_distances: Vec<f64>,
    pub sl_distance: f64,
    pub tp_pct: f64,
    pub be_pct: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
}

impl GridParams {
    /// Parse from `KEY=VALUE` text. Comments start with `#`.
    pub fn parse(text: &str) -> GridResult<Self> {
        let mut raw: HashMap<String, String> = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("ignoring unknown config key '{}'", key);
                continue;
            }
            raw.insert(key, value.trim().to_string());
        }

        let params = Self {
            initial_capital: get_f64(&raw, "INITIAL_CAPITAL")?,
            leverage_long: get_u32(&raw, "LEVERAGE_LONG")?,
            leverage_short: get_u32(&raw, "LEVERAGE_SHORT")?,
            trade_direction: get_direction(&raw, "TRADE_DIRECTION")?,
            grid_range_pct: get_f64(&raw, "GRID_RANGE_PCT")?,
            max_entry_level: get_u32(&raw, "MAX_ENTRY_LEVEL")? as u8,
            entry_ratios: get_list(&raw, "ENTRY_RATIOS")?,
            level_distances: get_list(&raw, "LEVEL_DISTANCES")?,
            sl_distance: get_f64(&raw, "SL_DISTANCE")?,
            tp_pct: get_f64(&raw, "TP_PCT")?,
            be_pct: get_f64(&raw, "BE_PCT")?,
            maker_fee: get_f64(&raw, "MAKER_FEE")?,
            taker_fee: get_f64(&raw, "TAKER_FEE")?,
        };

        params.validate()?;
        Ok(params)
    }

    /// Load and validate from a file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GridError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&text)
    }

    /// Reject out-of-range values before a snapshot is published
    pub fn validate(&self) -> GridResult<()> {
        let n = self.max_entry_level as usize;

        if self.initial_capital <= 0.0 {
            return Err(GridError::InvalidConfig(
                "INITIAL_CAPITAL must be positive".into(),
            ));
        }
        if self.leverage_long == 0 || self.leverage_short == 0 {
            return Err(GridError::InvalidConfig("leverage must be >= 1".into()));
        }
        if self.grid_range_pct <= 0.0 {
            return Err(GridError::InvalidConfig(
                "GRID_RANGE_PCT must be positive".into(),
            ));
        }
        if n == 0 {
            return Err(GridError::InvalidConfig(
                "MAX_ENTRY_LEVEL must be >= 1".into(),
            ));
        }
        if self.entry_ratios.len() != n {
            return Err(GridError::InvalidConfig(format!(
                "ENTRY_RATIOS needs {} values, got {}",
                n,
                self.entry_ratios.len()
            )));
        }
        if self.level_distances.len() != n {
            return Err(GridError::InvalidConfig(format!(
                "LEVEL_DISTANCES needs {} values, got {}",
                n,
                self.level_distances.len()
            )));
        }
        if self.entry_ratios.iter().any(|r| *r <= 0.0) {
            return Err(GridError::InvalidConfig(
                "ENTRY_RATIOS must all be positive".into(),
            ));
        }
        let ratio_sum: f64 = self.entry_ratios.iter().sum();
        if ratio_sum > 1.0 + 1e-9 {
            return Err(GridError::InvalidConfig(format!(
                "ENTRY_RATIOS sum {ratio_sum:.4} exceeds 1"
            )));
        }
        let mut prev = 0.0;
        for (i, d) in self.level_distances.iter().enumerate() {
            if *d <= prev || *d >= 1.0 {
                return Err(GridError::InvalidConfig(format!(
                    "LEVEL_DISTANCES must be strictly increasing in (0, 1), bad value {} at index {}",
                    d, i
                )));
            }
            prev = *d;
        }
        if self.sl_distance <= prev || self.sl_distance >= 1.0 {
            return Err(GridError::InvalidConfig(
                "SL_DISTANCE must exceed the deepest level distance".into(),
            ));
        }
        if self.be_pct <= 0.0 || self.tp_pct <= self.be_pct {
            return Err(GridError::InvalidConfig(
                "require 0 < BE_PCT < TP_PCT".into(),
            ));
        }
        if self.maker_fee < 0.0 || self.taker_fee < 0.0 {
            return Err(GridError::InvalidConfig("fees must be >= 0".into()));
        }

        Ok(())
    }

    /// Leverage applied to entries on `side`
    pub fn leverage_for(&self, side: PositionSide) -> u32 {
        match side {
            PositionSide::Short => self.leverage_short,
            _ => self.leverage_long,
        }
    }

    /// 1-based level distance accessor
    pub fn level_distance(&self, level: u8) -> f64 {
        self.level_distances[level as usize - 1]
    }

    /// 1-based entry ratio accessor
    pub fn entry_ratio(&self, level: u8) -> f64 {
        self.entry_ratios[level as usize - 1]
    }
}

fn get_raw<'a>(raw: &'a HashMap<String, String>, key: &str) -> GridResult<&'a str> {
    raw.get(key)
        .map(String::as_str)
        .ok_or_else(|| GridError::InvalidConfig(format!("missing required key {key}")))
}

fn get_f64(raw: &HashMap<String, String>, key: &str) -> GridResult<f64> {
    get_raw(raw, key)?
        .parse()
        .map_err(|_| GridError::InvalidConfig(format!("{key} is not a number")))
}

fn get_u32(raw: &HashMap<String, String>, key: &str) -> GridResult<u32> {
    get_raw(raw, key)?
        .parse()
        .map_err(|_| GridError::InvalidConfig(format!("{key} is not an integer")))
}

fn get_direction(raw: &HashMap<String, String>, key: &str) -> GridResult<TradeDirection> {
    let s = get_raw(raw, key)?;
    TradeDirection::parse(s)
        .ok_or_else(|| GridError::InvalidConfig(format!("{key} must be LONG, SHORT or BOTH")))
}

fn get_list(raw: &HashMap<String, String>, key: &str) -> GridResult<Vec<f64>> {
    get_raw(raw, key)?
        .split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| GridError::InvalidConfig(format!("{key} has a non-numeric element")))
        })
        .collect()
}

/// Watches the parameter file and keeps the last good snapshot
///
/// The event loop calls [`ConfigWatcher::reload`] on its own schedule; a
/// failed reload never disturbs running ticks.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<GridParams>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Load the initial snapshot. A bad file at startup is fatal.
    pub fn load(path: impl Into<PathBuf>) -> GridResult<Self> {
        let path = path.into();
        let params = GridParams::load_from_file(&path)?;
        let last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path,
            current: Arc::new(params),
            last_modified,
        })
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<GridParams> {
        Arc::clone(&self.current)
    }

    /// Re-read the file if it changed; last good snapshot wins on error.
    ///
    /// Returns `true` when a new snapshot was published.
    pub fn reload(&mut self) -> bool {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if modified.is_some() && modified == self.last_modified {
            return false;
        }

        match GridParams::load_from_file(&self.path) {
            Ok(params) => {
                self.last_modified = modified;
                if *self.current != params {
                    self.current = Arc::new(params);
                    return true;
                }
                false
            }
            Err(e) => {
                warn!(
                    "config reload failed, keeping previous snapshot: {}",
                    e
                );
                false
            }
        }
    }
}
