use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised anywhere in the trading loop
///
/// Policy rejections (daily caps, cooldowns, exposure headroom) are not
/// errors; they are reported as `false` from the risk predicates.
#[derive(Error, Debug)]
pub enum TradingError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Market data errors
    #[error("Market data feed timed out: {0}")]
    FeedTimeout(String),

    #[error("Market data feed error: {0}")]
    Feed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Missing market data: {0}")]
    MissingData(String),

    // Strategy / execution errors
    #[error("Strategy {strategy} failed: {reason}")]
    Strategy { strategy: String, reason: String },

    #[error("Order routing failed: {0}")]
    Execution(String),

    #[error("Exit plan already registered for position {0}")]
    DuplicateExitPlan(String),

    // Process level
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("State persistence failed: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse fault category used by the recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The process cannot continue safely
    Fatal,
    /// Expected to clear on its own (timeouts, throttling)
    Transient,
    /// Bad or missing input for a single symbol or strategy
    Data,
    Other,
}

impl TradingError {
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TradingError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn fault_kind(&self) -> FaultKind {
        match self {
            TradingError::Config(_)
            | TradingError::InvalidConfig { .. }
            | TradingError::ResourceExhausted(_)
            | TradingError::Fatal(_) => FaultKind::Fatal,
            TradingError::FeedTimeout(_)
            | TradingError::Feed(_)
            | TradingError::RateLimited(_) => FaultKind::Transient,
            TradingError::MissingData(_) => FaultKind::Data,
            TradingError::Strategy { .. }
            | TradingError::Execution(_)
            | TradingError::DuplicateExitPlan(_)
            | TradingError::Persistence(_)
            | TradingError::Io(_)
            | TradingError::Json(_)
            | TradingError::Toml(_) => FaultKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.fault_kind() == FaultKind::Transient
    }

    pub fn is_data_fault(&self) -> bool {
        self.fault_kind() == FaultKind::Data
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert_eq!(
            TradingError::FeedTimeout("BTCUSDT".into()).fault_kind(),
            FaultKind::Transient
        );
        assert_eq!(
            TradingError::RateLimited("429".into()).fault_kind(),
            FaultKind::Transient
        );
        assert_eq!(
            TradingError::MissingData("rsi".into()).fault_kind(),
            FaultKind::Data
        );
        assert_eq!(
            TradingError::ResourceExhausted("memory".into()).fault_kind(),
            FaultKind::Fatal
        );
        assert_eq!(
            TradingError::Execution("rejected".into()).fault_kind(),
            FaultKind::Other
        );
    }

    #[test]
    fn test_error_display() {
        let err = TradingError::invalid_config("max_daily_trades", "must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for max_daily_trades: must be positive"
        );
    }
}
