pub mod decision_engine;
pub mod decision_log;
pub mod error_recovery;
pub mod execution;
pub mod system;

pub use decision_engine::{DecisionEngine, EngineConfig, EngineSnapshot, TickSummary};
pub use decision_log::{DecisionKind, DecisionLog, DecisionRecord};
pub use error_recovery::{
    retry_with_backoff, ErrorRecord, ErrorRecoveryManager, RecoveryAction, RecoveryConfig,
    RecoveryState, RecoveryStatistics, RetryConfig,
};
pub use execution::PaperRouter;
pub use system::{ShutdownHandle, TradingSystem};
