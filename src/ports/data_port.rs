//! Data access port trait.

use crate::domain::error::TradesimError;
use crate::domain::ohlcv::OhlcvBar;
use chrono::NaiveDateTime;

pub trait DataPort {
    /// Bars for `symbol` in timestamp order, limited to `[start, end]` when
    /// either bound is given.
    fn fetch_bars(
        &self,
        symbol: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, TradesimError>;

    fn list_symbols(&self) -> Result<Vec<String>, TradesimError>;
}
