//! Configuration access port trait.
//!
//! Values come back as raw strings; typed parsing and validation live in
//! `domain::config_validation`.

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
}
