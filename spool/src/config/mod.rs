//! Daemon configuration, loaded from an INI file.
//!
//! Settings structs live in [`settings`], constants in [`defaults`], and
//! the INI key mapping in [`parser`]. Values not present in the file keep
//! their defaults; invalid values are rejected at startup with a
//! section/key/value/reason diagnostic (a configuration error is fatal,
//! the daemon exits with code 1 and no partial service).

mod defaults;
mod parser;
mod settings;

pub use defaults::*;
pub use settings::{
    DispatchAlgo, FairShareBounds, IoSchedSettings, ListenAddr, LrsSettings, LtfsSettings,
    ScsiSettings, Settings, SyncSettings, TapeModelSettings, TlcSettings,
};

use std::path::Path;

use ini::Ini;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Read(#[from] ini::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// A mandatory piece of configuration is missing
    #[error("Missing configuration: {0}")]
    Missing(String),
}

impl Settings {
    /// Loads settings from an INI file, overlaying values onto defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path)?;
        parser::parse_ini(&ini)
    }

    /// Parses settings from an INI string. Used by tests.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::InvalidValue {
            section: String::new(),
            key: String::new(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        parser::parse_ini(&ini)
    }
}
