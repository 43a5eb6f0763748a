use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use polars::frame::DataFrame;

use crate::{
    config::DataSourceConfig,
    error::{DataSourceError, LockstepResult},
    io::StorageBackend,
    source::{DataSource, filter_window, normalize_datetime_column},
};

/// Reads a parquet file below the backend's `inputs/` prefix, normalizes
/// its datetime column, and filters to the requested window and symbols.
/// Works against any backend — local workspace, S3, or in-memory.
pub struct ParquetSource {
    config: DataSourceConfig,
    backend: Arc<dyn StorageBackend>,
}

impl ParquetSource {
    pub fn new(config: DataSourceConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self { config, backend }
    }

    fn input_path(&self) -> String {
        format!("inputs/{}", self.config.source_path)
    }
}

#[async_trait]
impl DataSource for ParquetSource {
    fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    async fn fetch(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        symbols: &[String],
    ) -> LockstepResult<DataFrame> {
        let path = self.input_path();
        let frame =
            self.backend
                .load_table(&path)
                .await?
                .ok_or_else(|| DataSourceError::NotFound {
                    name: self.config.name.clone(),
                    path: path.clone(),
                })?;

        let frame = normalize_datetime_column(frame, &self.config.datetime_column)?;
        filter_window(frame, start, end, symbols)
    }
}
