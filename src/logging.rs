use crate::error::{Result, TradingError};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Logging sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level: error, warn, info, debug or trace
    pub level: String,
    /// Per-module overrides, e.g. `"autotrader::exits" = "debug"`
    pub module_levels: BTreeMap<String, String>,
    /// Also append to this file when set
    pub file: Option<PathBuf>,
    /// Mirror log lines to stdout
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            file: None,
            stdout: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        parse_level(&self.level)?;
        for level in self.module_levels.values() {
            parse_level(level)?;
        }
        Ok(())
    }
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| TradingError::invalid_config("logging.level", format!("unknown level {level}")))
}

/// Install the process-wide log dispatcher
///
/// Must be called at most once; a second call fails because the `log`
/// facade only accepts one logger.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(parse_level(&config.level)?);

    for (module, level) in &config.module_levels {
        dispatch = dispatch.level_for(module.clone(), parse_level(level)?);
    }

    if config.stdout {
        dispatch = dispatch.chain(std::io::stdout());
    }
    if let Some(path) = &config.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch
        .apply()
        .map_err(|e| TradingError::Config(format!("logger already initialised: {e}")))
}
