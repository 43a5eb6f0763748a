use async_trait::async_trait;
use chrono::NaiveDateTime;
use polars::frame::DataFrame;

use crate::{
    config::DataSourceConfig,
    error::LockstepResult,
    source::{DataSource, filter_window, normalize_datetime_column},
};

/// Serves a frame held in process, filtered per the source contract.
/// The test double of choice; also handy for notebook-style exploration
/// where data is already materialized.
pub struct MemorySource {
    config: DataSourceConfig,
    frame: DataFrame,
}

impl MemorySource {
    pub fn new(config: DataSourceConfig, frame: DataFrame) -> Self {
        Self { config, frame }
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    async fn fetch(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        symbols: &[String],
    ) -> LockstepResult<DataFrame> {
        let frame =
            normalize_datetime_column(self.frame.clone(), &self.config.datetime_column)?;
        filter_window(frame, start, end, symbols)
    }
}
