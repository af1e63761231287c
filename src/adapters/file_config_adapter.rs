//! INI file configuration adapter.
//!
//! Section and key names are case-insensitive.

use crate::domain::error::TradesimError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TradesimError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|reason| TradesimError::ConfigParse {
                file: path.display().to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, TradesimError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| TradesimError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[backtest]
symbol = EURUSD
initial_capital = 10000.0

[strategy]
kind = range_breakout
members = momentum, trend
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("backtest", "symbol"),
            Some("EURUSD".to_string())
        );
        assert_eq!(
            adapter.get_string("strategy", "members"),
            Some("momentum, trend".to_string())
        );
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter =
            FileConfigAdapter::from_string("[backtest]\ninitial_capital = 100\n").unwrap();
        assert_eq!(adapter.get_string("backtest", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn dotted_sections_are_case_insensitive() {
        let adapter =
            FileConfigAdapter::from_string("[instrument.XAUUSD]\nPoint_Size = 0.01\n").unwrap();
        assert_eq!(
            adapter.get_string("instrument.XAUUSD", "point_size"),
            Some("0.01".to_string())
        );
        assert_eq!(
            adapter.get_string("instrument.xauusd", "POINT_SIZE"),
            Some("0.01".to_string())
        );
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[backtest]\nintrabar_policy = target_first\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("backtest", "intrabar_policy"),
            Some("target_first".to_string())
        );
    }

    #[test]
    fn from_file_returns_error_for_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        assert!(matches!(
            result,
            Err(TradesimError::ConfigParse { ref file, .. }) if file.contains("config.ini")
        ));
    }
}
