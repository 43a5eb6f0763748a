pub mod memory;
pub mod parquet;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use polars::{
    frame::DataFrame,
    prelude::{DataType, IntoLazy, StrptimeOptions, TimeUnit, col as pl_col, lit},
};

use crate::{
    config::{Config, DataSourceConfig, SourceKind},
    error::{ConfigError, DataSourceError, LockstepResult, polars_err},
    io::StorageBackend,
    schema::{TableKind, col},
};

pub use memory::MemorySource;
pub use parquet::ParquetSource;

/// Name of the mandatory OHLCV data source.
pub const OHLCV_SOURCE_NAME: &str = "ohlcv";

/// A windowed, symbol-filtered table provider.
///
/// Contract: returned rows have `datetime` within `[start, end]`
/// (inclusive both ends) and `symbol` within `symbols`, or any symbol when
/// `symbols` is empty. The availability offset is applied once, by the
/// engine's window calculation — sources must not shift the window again.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn config(&self) -> &DataSourceConfig;

    async fn fetch(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        symbols: &[String],
    ) -> LockstepResult<DataFrame>;
}

/// Renames (and where needed casts) the configured datetime column to the
/// canonical `datetime` name and dtype. String and Date columns are cast
/// to microsecond datetimes; an already-Datetime column is only renamed.
pub fn normalize_datetime_column(
    frame: DataFrame,
    datetime_column: &str,
) -> LockstepResult<DataFrame> {
    let Some(dtype) = frame.schema().get(datetime_column).cloned() else {
        return Err(DataSourceError::MissingDatetimeColumn {
            column: datetime_column.to_string(),
        }
        .into());
    };

    let frame = match dtype {
        DataType::Datetime(_, _) => {
            if datetime_column == col::DATETIME {
                return Ok(frame);
            }
            frame
                .lazy()
                .rename([datetime_column], [col::DATETIME], true)
                .collect()
                .map_err(polars_err)?
        }
        DataType::String => {
            // Format inference covers both date-only and full datetime
            // strings.
            let parsed = pl_col(datetime_column)
                .str()
                .to_datetime(
                    Some(TimeUnit::Microseconds),
                    None,
                    StrptimeOptions::default(),
                    lit("raise"),
                )
                .alias(col::DATETIME);
            let collected = frame
                .lazy()
                .with_column(parsed)
                .collect()
                .map_err(polars_err)?;
            if datetime_column == col::DATETIME {
                collected
            } else {
                collected.drop(datetime_column).map_err(polars_err)?
            }
        }
        _ => {
            // Date columns and integer epochs go through a cast.
            let collected = frame
                .lazy()
                .with_column(
                    pl_col(datetime_column)
                        .cast(DataType::Datetime(TimeUnit::Microseconds, None))
                        .alias(col::DATETIME),
                )
                .collect()
                .map_err(polars_err)?;
            if datetime_column == col::DATETIME {
                collected
            } else {
                collected.drop(datetime_column).map_err(polars_err)?
            }
        }
    };

    Ok(frame)
}

/// Keeps rows with `datetime` in `[start, end]` and, when `symbols` is
/// non-empty, `symbol` among them.
pub fn filter_window(
    frame: DataFrame,
    start: NaiveDateTime,
    end: NaiveDateTime,
    symbols: &[String],
) -> LockstepResult<DataFrame> {
    let mut predicate = pl_col(col::DATETIME)
        .gt_eq(lit(start))
        .and(pl_col(col::DATETIME).lt_eq(lit(end)));

    if let Some(symbol_predicate) = symbols
        .iter()
        .map(|s| pl_col(col::SYMBOL).eq(lit(s.as_str())))
        .reduce(|a, b| a.or(b))
    {
        predicate = predicate.and(symbol_predicate);
    }

    frame.lazy().filter(predicate).collect().map_err(polars_err)
}

// ================================================================================================
// OHLCV Validation Wrapper
// ================================================================================================

/// Decorates a source so every fetched frame passes the OHLCV contract
/// before anyone downstream sees it.
pub struct ValidatedOhlcvSource {
    inner: Box<dyn DataSource>,
}

impl ValidatedOhlcvSource {
    pub fn new(inner: Box<dyn DataSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DataSource for ValidatedOhlcvSource {
    fn config(&self) -> &DataSourceConfig {
        self.inner.config()
    }

    async fn fetch(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        symbols: &[String],
    ) -> LockstepResult<DataFrame> {
        let frame = self.inner.fetch(start, end, symbols).await?;
        TableKind::Ohlcv.validate(frame)
    }
}

// ================================================================================================
// Config-driven Factory
// ================================================================================================

/// Builds every configured data source. The `ohlcv` source is wrapped in
/// the validating decorator so bar data entering the pipeline always
/// satisfies the OHLCV contract.
pub fn load_data_sources(
    config: &Config,
    backend: Arc<dyn StorageBackend>,
) -> LockstepResult<HashMap<String, Box<dyn DataSource>>> {
    let mut sources: HashMap<String, Box<dyn DataSource>> = HashMap::new();

    for ds_config in &config.data_sources {
        let source: Box<dyn DataSource> = match ds_config.kind {
            SourceKind::Parquet => {
                Box::new(ParquetSource::new(ds_config.clone(), backend.clone()))
            }
            SourceKind::Memory => {
                return Err(ConfigError::Invalid(format!(
                    "data source '{}': memory sources are constructed programmatically, not from config",
                    ds_config.name
                ))
                .into());
            }
        };

        let source = if ds_config.name == OHLCV_SOURCE_NAME {
            Box::new(ValidatedOhlcvSource::new(source)) as Box<dyn DataSource>
        } else {
            source
        };

        sources.insert(ds_config.name.clone(), source);
    }

    Ok(sources)
}

#[cfg(test)]
mod test {
    use polars::df;

    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    #[test]
    fn normalize_renames_datetime_column() {
        let frame = df!(
            "quote_time" => [ts("2024-01-01T00:00:00")],
            "symbol" => ["AAPL"],
        )
        .unwrap();

        let normalized = normalize_datetime_column(frame, "quote_time").unwrap();
        assert!(normalized.schema().contains(col::DATETIME));
        assert!(!normalized.schema().contains("quote_time"));
    }

    #[test]
    fn normalize_casts_string_column() {
        let frame = df!(
            "day" => ["2024-01-01", "2024-01-02"],
            "symbol" => ["AAPL", "AAPL"],
        )
        .unwrap();

        let normalized = normalize_datetime_column(frame, "day").unwrap();
        match normalized.column(col::DATETIME).unwrap().dtype() {
            DataType::Datetime(_, _) => {}
            other => panic!("expected datetime, got {other:?}"),
        }
    }

    #[test]
    fn normalize_passes_canonical_column_through() {
        let frame = df!(
            col::DATETIME => [ts("2024-01-01T00:00:00")],
            "symbol" => ["AAPL"],
        )
        .unwrap();

        let normalized = normalize_datetime_column(frame.clone(), col::DATETIME).unwrap();
        assert!(normalized.equals(&frame));
    }

    #[test]
    fn normalize_missing_column_errors() {
        let frame = df!("symbol" => ["AAPL"]).unwrap();
        let err = normalize_datetime_column(frame, "ts").unwrap_err();
        assert!(err.to_string().contains("'ts'"));
    }

    #[test]
    fn filter_window_is_inclusive_and_symbol_aware() {
        let frame = df!(
            col::DATETIME => [
                ts("2024-01-01T00:00:00"),
                ts("2024-01-02T00:00:00"),
                ts("2024-01-03T00:00:00"),
                ts("2024-01-02T00:00:00"),
            ],
            col::SYMBOL => ["AAPL", "AAPL", "AAPL", "GOOG"],
            "value" => [1.0, 2.0, 3.0, 4.0],
        )
        .unwrap();

        let filtered = filter_window(
            frame,
            ts("2024-01-01T00:00:00"),
            ts("2024-01-02T00:00:00"),
            &["AAPL".to_string()],
        )
        .unwrap();

        assert_eq!(filtered.height(), 2);
        let values: Vec<f64> = filtered
            .column("value")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn empty_symbol_list_keeps_all_symbols() {
        let frame = df!(
            col::DATETIME => [ts("2024-01-01T00:00:00"), ts("2024-01-01T00:00:00")],
            col::SYMBOL => ["AAPL", "GOOG"],
        )
        .unwrap();

        let filtered = filter_window(
            frame,
            ts("2024-01-01T00:00:00"),
            ts("2024-01-01T00:00:00"),
            &[],
        )
        .unwrap();

        assert_eq!(filtered.height(), 2);
    }
}
