//! Top-level error types for dock-schedule.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration and credential loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read secret {path}: {source}")]
    Secret {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to read TLS material {path}: {source}")]
    TlsMaterial {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Cron spec admission errors. These surface to the submitter and are
/// never persisted.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("exactly one of interval/at must be set")]
    IntervalAtConflict,

    #[error("\"at\" cannot be combined with frequency \"second\"")]
    AtWithSecond,

    #[error("invalid \"at\" time format for frequency {frequency}: {value}")]
    InvalidAtFormat { frequency: String, value: String },

    #[error("interval must be a positive integer")]
    InvalidInterval,

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("cannot infer script type for run target: {0}")]
    UnknownScriptType(String),
}

/// Document store connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Operation(#[from] mongodb::error::Error),
}

/// Broker session errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection budget exhausted after {attempts} attempts")]
    ConnectBudgetExhausted { attempts: u32 },

    #[error("broker session is stopped")]
    Stopped,

    #[error("timeout waiting for connection unblock")]
    BlockedTimeout,

    #[error("broker protocol error: {0}")]
    Protocol(#[from] lapin::Error),
}

/// Job runner invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn runner process: {0}")]
    Spawn(std::io::Error),

    #[error("runner produced no exit status")]
    NoExitStatus,

    #[error("failed to stage run directory: {0}")]
    Stage(std::io::Error),
}
