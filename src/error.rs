use chrono::NaiveDateTime;
use polars::error::PolarsError;
use thiserror::Error;

use crate::{engine::StepName, schema::TableKind, store::ArtifactKind};

pub type LockstepResult<T> = Result<T, LockstepError>;

#[derive(Debug, Error)]
pub enum LockstepError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("data frame operation failed: {0}")]
    Frame(String),
}

/// A table failed its declared column/type contract.
///
/// Raised by the validators in [`crate::schema`] and surfaced to the caller
/// unchanged; the engine never wraps or retries schema violations.
#[derive(Debug, Error)]
#[error("{table} table violates its schema: {reason}")]
pub struct SchemaError {
    pub table: TableKind,
    pub reason: SchemaViolation,
}

#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("column '{name}' has type {actual}, expected {expected}")]
    WrongType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("column '{0}' contains null values")]
    ForbiddenNull(String),

    #[error("column '{name}' contains disallowed values: {values:?}")]
    DisallowedValue { name: String, values: Vec<String> },
}

/// Errors raised by the step state machine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A user component, data source, or exchange client failed inside a
    /// step. Carries the originating step and target datetime for
    /// diagnostics; the original error rides along as the cause.
    #[error("[{step}] {}: {message}\n  cause: {cause}", .target_datetime.format("%Y-%m-%d %H:%M:%S"))]
    Step {
        step: StepName,
        target_datetime: NaiveDateTime,
        message: String,
        #[source]
        cause: Box<LockstepError>,
    },

    /// A step required an artifact that a prior step has not produced yet.
    /// Deliberately not wrapped in [`EngineError::Step`]: the cause is
    /// known and explicit.
    #[error("[{step}] {}: missing prerequisite artifact '{needed}'; run '{}' first", .target_datetime.format("%Y-%m-%d %H:%M:%S"), .needed.producing_step())]
    PrerequisiteMissing {
        step: StepName,
        target_datetime: NaiveDateTime,
        needed: ArtifactKind,
    },

    #[error("invalid step name: '{0}'")]
    InvalidStepName(String),
}

/// Errors from the artifact-store backends (I/O failure, corruption).
/// Never retried by the core.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failure at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt or unreadable data at '{path}': {message}")]
    Corrupt { path: String, message: String },

    #[error("object store failure at '{path}': {message}")]
    Backend { path: String, message: String },

    #[error("invalid storage path '{path}': {message}")]
    InvalidPath { path: String, message: String },
}

/// Errors from data-source collaborators.
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("data source '{name}' has no data at '{path}'")]
    NotFound { name: String, path: String },

    #[error("datetime column '{column}' not present in source frame")]
    MissingDatetimeColumn { column: String },

    #[error("data source '{name}' failed: {message}")]
    Fetch { name: String, message: String },
}

/// Errors from exchange-client collaborators.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("order submission failed: {0}")]
    Submit(String),

    #[error("fill query failed: {0}")]
    Fills(String),

    #[error("position query failed: {0}")]
    Positions(String),
}

/// Errors from user-supplied strategy components.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("missing strategy input: {0}")]
    MissingInput(String),

    #[error("invalid strategy parameters: {0}")]
    InvalidParams(String),

    #[error("strategy logic error: {0}")]
    Logic(String),
}

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub(crate) fn polars_err(e: PolarsError) -> LockstepError {
    LockstepError::Frame(e.to_string())
}
