use std::collections::HashMap;

use polars::frame::DataFrame;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LockstepResult, StrategyError, polars_err},
    schema::{OrderRow, Side, col, orders_to_frame},
    strategy::EntryOrderCreator,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualWeightParams {
    /// Capital allocated across the plan.
    pub capital: f64,
    /// Minimum |target weight − current weight| that triggers an order.
    /// Suppresses churn from small drifts.
    pub rebalance_threshold: f64,
}

impl Default for EqualWeightParams {
    fn default() -> Self {
        Self {
            capital: 1_000_000.0,
            rebalance_threshold: 0.05,
        }
    }
}

/// Allocates capital equally (1/N) across the planned symbols and emits
/// market orders sized off each symbol's open price. Symbols without a
/// price in the OHLCV window are skipped, as are symbols whose current
/// weight is already within the rebalance threshold of target.
///
/// Order side follows the plan's `signal_strength` sign when the column is
/// present (long positive, short negative); without it every entry is a
/// buy.
pub struct EqualWeightEntryOrderCreator {
    params: EqualWeightParams,
}

impl EqualWeightEntryOrderCreator {
    pub fn new(params: EqualWeightParams) -> LockstepResult<Self> {
        if params.capital <= 0.0 {
            return Err(
                StrategyError::InvalidParams("capital must be positive".to_string()).into(),
            );
        }
        if !(0.0..=1.0).contains(&params.rebalance_threshold) {
            return Err(StrategyError::InvalidParams(
                "rebalance_threshold must lie in [0, 1]".to_string(),
            )
            .into());
        }
        Ok(Self { params })
    }
}

impl EntryOrderCreator for EqualWeightEntryOrderCreator {
    fn create(
        &self,
        portfolio_plan: &DataFrame,
        current_positions: &DataFrame,
        ohlcv: &DataFrame,
    ) -> LockstepResult<DataFrame> {
        if portfolio_plan.height() == 0 {
            return orders_to_frame(&[]);
        }

        let open_prices = first_open_by_symbol(ohlcv)?;
        let held = quantity_by_symbol(current_positions)?;

        let symbols = portfolio_plan
            .column(col::SYMBOL)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?;
        let strengths = portfolio_plan
            .column(col::SIGNAL_STRENGTH)
            .ok()
            .map(|c| c.f64().map_err(polars_err))
            .transpose()?;

        let target_weight = 1.0 / portfolio_plan.height() as f64;
        let mut orders = Vec::new();

        for (row, symbol) in symbols.into_iter().enumerate() {
            let Some(symbol) = symbol else { continue };
            let Some(price) = open_prices.get(symbol).copied() else {
                continue;
            };

            let current_quantity = held.get(symbol).copied().unwrap_or(0.0);
            let current_weight = current_quantity * price / self.params.capital;
            if (target_weight - current_weight).abs() < self.params.rebalance_threshold {
                continue;
            }

            let strength = strengths
                .and_then(|s| s.get(row))
                .unwrap_or(1.0);
            let side = if strength > 0.0 { Side::Buy } else { Side::Sell };

            let quantity = (self.params.capital * target_weight / price).abs();
            if quantity <= 0.0 {
                continue;
            }
            orders.push(OrderRow::market(symbol, side, quantity));
        }

        orders_to_frame(&orders)
    }
}

/// First open price per symbol in frame order.
fn first_open_by_symbol(ohlcv: &DataFrame) -> LockstepResult<HashMap<String, f64>> {
    let symbols = ohlcv
        .column(col::SYMBOL)
        .map_err(polars_err)?
        .str()
        .map_err(polars_err)?;
    let opens = ohlcv
        .column(col::OPEN)
        .map_err(polars_err)?
        .f64()
        .map_err(polars_err)?;

    let mut prices = HashMap::new();
    for (symbol, open) in symbols.into_iter().zip(opens.into_iter()) {
        if let (Some(symbol), Some(open)) = (symbol, open) {
            prices.entry(symbol.to_string()).or_insert(open);
        }
    }
    Ok(prices)
}

fn quantity_by_symbol(positions: &DataFrame) -> LockstepResult<HashMap<String, f64>> {
    let symbols = positions
        .column(col::SYMBOL)
        .map_err(polars_err)?
        .str()
        .map_err(polars_err)?;
    let quantities = positions
        .column(col::QUANTITY)
        .map_err(polars_err)?
        .f64()
        .map_err(polars_err)?;

    Ok(symbols
        .into_iter()
        .zip(quantities.into_iter())
        .filter_map(|(s, q)| Some((s?.to_string(), q?)))
        .collect())
}
