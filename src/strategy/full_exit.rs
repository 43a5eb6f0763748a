use polars::frame::DataFrame;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LockstepResult, StrategyError, polars_err},
    schema::{OrderRow, Side, col, orders_to_frame},
    strategy::ExitOrderCreator,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FullExitParams {
    /// Fraction of each position to close: 1.0 closes everything, 0.5
    /// closes half.
    pub exit_threshold: f64,
}

impl Default for FullExitParams {
    fn default() -> Self {
        Self { exit_threshold: 1.0 }
    }
}

/// Emits a market order against every open position: longs are sold,
/// shorts are bought back, each sized by `exit_threshold`. A threshold of
/// zero produces no orders.
pub struct FullExitOrderCreator {
    params: FullExitParams,
}

impl FullExitOrderCreator {
    pub fn new(params: FullExitParams) -> LockstepResult<Self> {
        if !(0.0..=1.0).contains(&params.exit_threshold) {
            return Err(StrategyError::InvalidParams(
                "exit_threshold must lie in [0, 1]".to_string(),
            )
            .into());
        }
        Ok(Self { params })
    }
}

impl ExitOrderCreator for FullExitOrderCreator {
    fn create(
        &self,
        current_positions: &DataFrame,
        _ohlcv: &DataFrame,
    ) -> LockstepResult<DataFrame> {
        if current_positions.height() == 0 {
            return orders_to_frame(&[]);
        }

        let symbols = current_positions
            .column(col::SYMBOL)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?;
        let quantities = current_positions
            .column(col::QUANTITY)
            .map_err(polars_err)?
            .f64()
            .map_err(polars_err)?;

        let mut orders = Vec::new();
        for (symbol, quantity) in symbols.into_iter().zip(quantities.into_iter()) {
            let (Some(symbol), Some(quantity)) = (symbol, quantity) else {
                continue;
            };
            let exit_quantity = quantity.abs() * self.params.exit_threshold;
            if exit_quantity <= 0.0 {
                continue;
            }

            let side = if quantity > 0.0 { Side::Sell } else { Side::Buy };
            orders.push(OrderRow::market(symbol, side, exit_quantity));
        }

        orders_to_frame(&orders)
    }
}
