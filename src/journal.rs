//! Append-only CSV record of realized trade events

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::error;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::types::TradeEvent;

const HEADER: &str =
    "timestamp,symbol,event,level,price,qty,realized_pnl,capital,grid_center,start_grid_center";

/// One journalled row, built by the reconciler at the moment of the event
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub event: TradeEvent,
    pub level: u8,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub capital: f64,
    pub grid_center: Option<f64>,
    pub start_grid_center: Option<f64>,
}

/// Line-per-event CSV journal, one file per symbol
///
/// Flushed on every append; only a power failure can lose the last line.
pub struct TradeJournal {
    path: PathBuf,
    symbol: String,
    writer: BufWriter<File>,
}

impl TradeJournal {
    /// Open (or create) the journal, writing the header for a new file
    pub fn open(path: impl Into<PathBuf>, symbol: impl Into<String>) -> GridResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GridError::Journal(e.to_string()))?;
            }
        }

        let needs_header = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GridError::Journal(format!("{}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);

        if needs_header {
            writeln!(writer, "{HEADER}").map_err(|e| GridError::Journal(e.to_string()))?;
            writer.flush().map_err(|e| GridError::Journal(e.to_string()))?;
        }

        Ok(Self {
            path,
            symbol: symbol.into(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event row and flush
    pub fn record(&mut self, entry: &JournalEntry) -> GridResult<()> {
        let line = format!(
            "{},{},{},{},{:.8},{:.8},{:.8},{:.8},{},{}",
            Utc::now().to_rfc3339(),
            self.symbol,
            entry.event.label(),
            entry.level,
            entry.price,
            entry.qty,
            entry.realized_pnl,
            entry.capital,
            fmt_opt(entry.grid_center),
            fmt_opt(entry.start_grid_center),
        );

        writeln!(self.writer, "{line}").map_err(|e| GridError::Journal(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| GridError::Journal(e.to_string()))
    }

    /// Record, logging instead of failing the tick on journal I/O errors
    pub fn record_best_effort(&mut self, entry: &JournalEntry) {
        if let Err(e) = self.record(entry) {
            error!("journal append failed: {}", e);
        }
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.8}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gm-journal-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_header_written_once() {
        let path = temp_path("header.csv");
        std::fs::remove_file(&path).ok();

        {
            let mut journal = TradeJournal::open(&path, "BTCUSDC").unwrap();
            journal
                .record(&JournalEntry {
                    event: TradeEvent::Entry(1),
                    level: 1,
                    price: 99_500.0,
                    qty: 0.00753,
                    realized_pnl: 0.0,
                    capital: 1000.0,
                    grid_center: Some(100_000.0),
                    start_grid_center: Some(100_000.0),
                })
                .unwrap();
        }
        {
            let mut journal = TradeJournal::open(&path, "BTCUSDC").unwrap();
            journal
                .record(&JournalEntry {
                    event: TradeEvent::TakeProfit,
                    level: 1,
                    price: 99_997.5,
                    qty: 0.00753,
                    realized_pnl: 3.75,
                    capital: 1003.75,
                    grid_center: Some(99_997.5),
                    start_grid_center: Some(100_000.0),
                })
                .unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].contains("ENTRY_L1"));
        assert!(lines[2].contains(",TP,"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_empty_center_serializes_blank() {
        let path = temp_path("blank.csv");
        std::fs::remove_file(&path).ok();

        let mut journal = TradeJournal::open(&path, "ETHUSDC").unwrap();
        journal
            .record(&JournalEntry {
                event: TradeEvent::CancelAll,
                level: 0,
                price: 0.0,
                qty: 0.0,
                realized_pnl: 0.0,
                capital: 1000.0,
                grid_center: None,
                start_grid_center: None,
            })
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().nth(1).unwrap().ends_with(",,"));

        std::fs::remove_file(&path).ok();
    }
}
