use std::collections::HashMap;

use polars::{
    frame::DataFrame,
    prelude::{IntoLazy, RollingOptionsFixedWindow, SortMultipleOptions, col as pl_col},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{LockstepResult, StrategyError, polars_err},
    schema::{TableKind, col},
    source::OHLCV_SOURCE_NAME,
    strategy::SignalCalculator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovingAverageCrossParams {
    pub short_window: usize,
    pub long_window: usize,
}

/// Moving-average cross signals: `signal = short_ma − long_ma`,
/// computed per symbol over the close price. Positive values lean golden
/// cross, negative values dead cross.
pub struct MovingAverageCrossCalculator {
    params: MovingAverageCrossParams,
}

impl MovingAverageCrossCalculator {
    pub fn new(params: MovingAverageCrossParams) -> LockstepResult<Self> {
        if params.short_window == 0 {
            return Err(StrategyError::InvalidParams(
                "short_window must be positive".to_string(),
            )
            .into());
        }
        if params.short_window >= params.long_window {
            return Err(StrategyError::InvalidParams(format!(
                "short_window must be smaller than long_window: short={}, long={}",
                params.short_window, params.long_window
            ))
            .into());
        }
        Ok(Self { params })
    }

    fn rolling(window_size: usize) -> RollingOptionsFixedWindow {
        RollingOptionsFixedWindow {
            window_size,
            min_periods: window_size,
            ..Default::default()
        }
    }
}

impl SignalCalculator for MovingAverageCrossCalculator {
    fn calculate(&self, data_sources: &HashMap<String, DataFrame>) -> LockstepResult<DataFrame> {
        let ohlcv = data_sources.get(OHLCV_SOURCE_NAME).ok_or_else(|| {
            StrategyError::MissingInput(format!("'{OHLCV_SOURCE_NAME}' data source"))
        })?;

        let signals = ohlcv
            .clone()
            .lazy()
            .sort([col::SYMBOL, col::DATETIME], SortMultipleOptions::default())
            .with_columns([
                pl_col(col::CLOSE)
                    .rolling_mean(Self::rolling(self.params.short_window))
                    .over([pl_col(col::SYMBOL)])
                    .alias("short_ma"),
                pl_col(col::CLOSE)
                    .rolling_mean(Self::rolling(self.params.long_window))
                    .over([pl_col(col::SYMBOL)])
                    .alias("long_ma"),
            ])
            .with_column((pl_col("short_ma") - pl_col("long_ma")).alias(col::SIGNAL))
            .select([
                pl_col(col::DATETIME),
                pl_col(col::SYMBOL),
                pl_col(col::SIGNAL),
            ])
            .collect()
            .map_err(polars_err)?;

        TableKind::Signal.validate(signals)
    }
}
