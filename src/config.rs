use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    error::{ConfigError, LockstepResult},
    source::OHLCV_SOURCE_NAME,
};

// ================================================================================================
// General / Storage
// ================================================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    S3,
    Memory,
}

/// Strategy-wide settings: naming and where artifacts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub strategy_name: String,

    pub storage_type: StorageType,

    /// Root directory for the local backend. Required when
    /// `storage_type = "local"`.
    #[serde(default)]
    pub workspace: Option<String>,

    /// Required when `storage_type = "s3"`.
    #[serde(default)]
    pub s3_bucket: Option<String>,

    /// Required when `storage_type = "s3"`.
    #[serde(default)]
    pub s3_region: Option<String>,
}

// ================================================================================================
// Data Sources
// ================================================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Parquet,
    /// In-process frames for tests; cannot be built from configuration.
    Memory,
}

/// One configured data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Source identifier; exactly one source must be named `ohlcv`.
    pub name: String,

    /// Name of the datetime column in the raw frame; normalized to
    /// `datetime` on fetch.
    pub datetime_column: String,

    /// Availability delay in seconds. The fetch window shifts back by this
    /// amount; negative values shift it forward.
    #[serde(default)]
    pub offset_seconds: i64,

    /// Length of the fetch window in seconds. Must be positive.
    pub window_seconds: i64,

    /// Which source implementation to construct.
    #[serde(default)]
    pub kind: SourceKind,

    /// Path below the backend's `inputs/` prefix (parquet sources).
    #[serde(default)]
    pub source_path: String,
}

// ================================================================================================
// Costs
// ================================================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MarketFillPriceType {
    /// Fill at the next bar's open (the more realistic default).
    #[default]
    NextOpen,
    /// Fill at the current bar's close.
    CurrentClose,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LimitFillBarType {
    /// Judge limit fills against the next bar's high/low (default).
    #[default]
    NextBar,
    /// Judge limit fills against the current bar's high/low.
    CurrentBar,
}

/// Trading-cost model for the execution simulator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CostConfig {
    /// Commission rate on traded notional, e.g. 0.001 = 0.1%.
    #[serde(default)]
    pub commission_rate: f64,

    /// Slippage on market fills, in basis points.
    #[serde(default)]
    pub slippage_bps: f64,

    #[serde(default)]
    pub market_fill_price_type: MarketFillPriceType,

    #[serde(default)]
    pub limit_fill_bar_type: LimitFillBarType,
}

// ================================================================================================
// Loop
// ================================================================================================

/// Per-step execution-timing offsets, in seconds.
///
/// These knobs are parsed and exposed but NOT applied by the core's fetch
/// window math, which uses only the per-data-source offsets. How they
/// compose with source offsets is left to a future revision; schedulers
/// that need per-step timing read them directly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepTimingConfig {
    #[serde(default)]
    pub calculate_signals_offset_seconds: i64,
    #[serde(default)]
    pub construct_portfolio_offset_seconds: i64,
    #[serde(default)]
    pub create_entry_orders_offset_seconds: i64,
    #[serde(default)]
    pub create_exit_orders_offset_seconds: i64,
    #[serde(default)]
    pub submit_entry_orders_offset_seconds: i64,
    #[serde(default)]
    pub submit_exit_orders_offset_seconds: i64,
}

/// Backtest loop settings, consumed by external schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Iteration frequency, e.g. "1d", "4h", "30m".
    #[serde(with = "humantime_duration")]
    pub frequency: Duration,

    /// RFC 3339 local datetime string, e.g. "2024-01-01T00:00:00".
    pub start_date: chrono::NaiveDateTime,

    pub end_date: chrono::NaiveDateTime,

    /// Symbols traded this run; empty means all symbols a source offers.
    #[serde(default)]
    pub universe: Vec<String>,

    #[serde(default)]
    pub step_timings: StepTimingConfig,
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(|e| D::Error::custom(format!("{raw}: {e}")))
    }
}

// ================================================================================================
// Top-level Config
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,

    pub data_sources: Vec<DataSourceConfig>,

    #[serde(default)]
    pub costs: CostConfig,

    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
}

impl Config {
    pub fn from_toml(path: impl AsRef<Path>) -> LockstepResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> LockstepResult<Self> {
        let config: Config = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn data_source(&self, name: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|ds| ds.name == name)
    }

    pub fn validate(&self) -> LockstepResult<()> {
        if self.general.strategy_name.is_empty() {
            return Err(invalid("general.strategy_name must not be empty"));
        }
        match self.general.storage_type {
            StorageType::Local if self.general.workspace.is_none() => {
                return Err(invalid(
                    "general.workspace is required for storage_type = \"local\"",
                ));
            }
            StorageType::S3
                if self.general.s3_bucket.is_none() || self.general.s3_region.is_none() =>
            {
                return Err(invalid(
                    "general.s3_bucket and general.s3_region are required for storage_type = \"s3\"",
                ));
            }
            _ => {}
        }

        if self.data_sources.is_empty() {
            return Err(invalid("at least one data source must be configured"));
        }
        if self.data_source(OHLCV_SOURCE_NAME).is_none() {
            return Err(invalid(
                "a data source named 'ohlcv' is required by the pipeline",
            ));
        }
        for ds in &self.data_sources {
            if ds.window_seconds <= 0 {
                return Err(invalid(format!(
                    "data source '{}': window_seconds must be positive, got {}",
                    ds.name, ds.window_seconds
                )));
            }
            if ds.datetime_column.is_empty() {
                return Err(invalid(format!(
                    "data source '{}': datetime_column must not be empty",
                    ds.name
                )));
            }
        }

        if self.costs.commission_rate < 0.0 {
            return Err(invalid("costs.commission_rate must not be negative"));
        }
        if self.costs.slippage_bps < 0.0 {
            return Err(invalid("costs.slippage_bps must not be negative"));
        }

        if self.loop_config.end_date <= self.loop_config.start_date {
            return Err(invalid("loop.end_date must be after loop.start_date"));
        }
        if self.loop_config.frequency.is_zero() {
            return Err(invalid("loop.frequency must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> crate::error::LockstepError {
    ConfigError::Invalid(message.into()).into()
}
