//! CSV file data adapter.
//!
//! One file per symbol, `<SYMBOL>.csv`, with a header row and columns
//! `timestamp,open,high,low,close,volume[,spread]`. Rows are returned in file
//! order; ordering is checked by the engine.

use crate::domain::config_validation::parse_datetime;
use crate::domain::error::TradesimError;
use crate::domain::ohlcv::OhlcvBar;
use crate::ports::data_port::DataPort;
use chrono::NaiveDateTime;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}.csv"))
    }
}

fn number(record: &csv::StringRecord, index: usize, name: &str, line: u64) -> Result<f64, TradesimError> {
    let raw = record.get(index).ok_or_else(|| TradesimError::Data {
        reason: format!("line {line}: missing {name} column"),
    })?;
    raw.trim().parse().map_err(|e| TradesimError::Data {
        reason: format!("line {line}: invalid {name} value '{raw}': {e}"),
    })
}

impl DataPort for CsvAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, TradesimError> {
        let path = self.csv_path(symbol);
        if !path.exists() {
            return Err(TradesimError::NoData {
                symbol: symbol.to_string(),
            });
        }

        let mut rdr = csv::Reader::from_path(&path)?;
        let spread_col = rdr
            .headers()?
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("spread"));

        let mut bars = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let ts_str = record.get(0).ok_or_else(|| TradesimError::Data {
                reason: format!("line {line}: missing timestamp column"),
            })?;
            let timestamp = parse_datetime(ts_str).ok_or_else(|| TradesimError::Data {
                reason: format!("line {line}: invalid timestamp '{ts_str}'"),
            })?;

            if start.is_some_and(|s| timestamp < s) || end.is_some_and(|e| timestamp > e) {
                continue;
            }

            let spread = match spread_col {
                Some(i) if record.get(i).is_some_and(|raw| !raw.trim().is_empty()) => {
                    Some(number(&record, i, "spread", line)?)
                }
                _ => None,
            };

            bars.push(OhlcvBar {
                timestamp,
                open: number(&record, 1, "open", line)?,
                high: number(&record, 2, "high", line)?,
                low: number(&record, 3, "low", line)?,
                close: number(&record, 4, "close", line)?,
                volume: number(&record, 5, "volume", line)?,
                spread,
            });
        }

        debug!(symbol, bars = bars.len(), path = %path.display(), "loaded bars");
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, TradesimError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| TradesimError::Data {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
                && let Some(stem) = path.file_stem()
            {
                symbols.push(stem.to_string_lossy().into_owned());
            }
        }

        symbols.sort();
        Ok(symbols)
    }
}
