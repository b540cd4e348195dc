//! Process configuration loaded from TOML.
//!
//! Every section is optional; anything left out takes the component default.

use crate::backtest::BacktestConfig;
use crate::error::{Result, TradingError};
use crate::exits::ExitConfig;
use crate::logging::LoggingConfig;
use crate::monitoring::MonitoringConfig;
use crate::realtime::{EngineConfig, RecoveryConfig, RetryConfig};
use crate::risk::RiskConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub exits: ExitConfig,
    pub recovery: RecoveryConfig,
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
    pub backtest: BacktestConfig,
    pub logging: LoggingConfig,
}

impl SystemConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SystemConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TradingError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.risk.validate()?;
        self.exits.validate()?;
        self.recovery.validate()?;
        self.retry.validate()?;
        self.monitoring.validate()?;
        self.backtest.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
