use polars::{
    frame::DataFrame,
    prelude::{IntoLazy, SortMultipleOptions, col as pl_col},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{LockstepResult, StrategyError, polars_err},
    schema::{TableKind, col},
    strategy::PortfolioConstructor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopNParams {
    /// Number of symbols to select.
    pub top_n: usize,
    /// Sort ascending instead of taking the largest signals.
    pub ascending: bool,
}

impl Default for TopNParams {
    fn default() -> Self {
        Self {
            top_n: 10,
            ascending: false,
        }
    }
}

/// Ranks signals by the `signal` column and keeps the top N symbols,
/// carrying the winning signal along as `signal_strength`.
///
/// Strategies emitting several signal columns must fold them into a single
/// `signal` column first, or supply their own constructor.
pub struct TopNPortfolioConstructor {
    params: TopNParams,
}

impl TopNPortfolioConstructor {
    pub fn new(params: TopNParams) -> LockstepResult<Self> {
        if params.top_n == 0 {
            return Err(
                StrategyError::InvalidParams("top_n must be positive".to_string()).into(),
            );
        }
        Ok(Self { params })
    }
}

impl PortfolioConstructor for TopNPortfolioConstructor {
    fn construct(
        &self,
        signals: &DataFrame,
        _current_positions: &DataFrame,
    ) -> LockstepResult<DataFrame> {
        if signals.height() == 0 {
            return TableKind::Portfolio.validate(empty_plan()?);
        }
        if !signals.schema().contains(col::SIGNAL) {
            return Err(StrategyError::MissingInput(format!(
                "'{}' column in signals",
                col::SIGNAL
            ))
            .into());
        }

        let plan = signals
            .clone()
            .lazy()
            .sort(
                [col::SIGNAL],
                SortMultipleOptions::default()
                    .with_order_descending(!self.params.ascending)
                    .with_nulls_last(true),
            )
            .limit(self.params.top_n as u32)
            .select([
                pl_col(col::DATETIME),
                pl_col(col::SYMBOL),
                pl_col(col::SIGNAL).alias(col::SIGNAL_STRENGTH),
            ])
            .collect()
            .map_err(polars_err)?;

        TableKind::Portfolio.validate(plan)
    }
}

fn empty_plan() -> LockstepResult<DataFrame> {
    polars::df!(
        col::DATETIME => Vec::<chrono::NaiveDateTime>::new(),
        col::SYMBOL => Vec::<String>::new(),
        col::SIGNAL_STRENGTH => Vec::<f64>::new(),
    )
    .map_err(polars_err)
}
