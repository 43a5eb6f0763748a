pub mod equal_weight;
pub mod full_exit;
pub mod moving_average;
pub mod top_n;

use std::collections::HashMap;

use polars::frame::DataFrame;

use crate::error::LockstepResult;

pub use equal_weight::{EqualWeightEntryOrderCreator, EqualWeightParams};
pub use full_exit::{FullExitOrderCreator, FullExitParams};
pub use moving_average::{MovingAverageCrossCalculator, MovingAverageCrossParams};
pub use top_n::{TopNParams, TopNPortfolioConstructor};

/// Computes signals from the fetched data sources.
///
/// The input map is keyed by data-source name and always includes `ohlcv`.
/// The output must satisfy the Signal contract (`datetime`, `symbol`);
/// any numeric columns beyond that are the strategy's business — the
/// engine carries them through untouched.
pub trait SignalCalculator: Send + Sync {
    fn calculate(&self, data_sources: &HashMap<String, DataFrame>) -> LockstepResult<DataFrame>;
}

/// Selects the symbols to hold this iteration from signals and current
/// positions. Output must satisfy the Portfolio contract; optional
/// columns like `signal_strength`, `priority`, and `tags` flow downstream
/// to the entry-order creator.
pub trait PortfolioConstructor: Send + Sync {
    fn construct(
        &self,
        signals: &DataFrame,
        current_positions: &DataFrame,
    ) -> LockstepResult<DataFrame>;
}

/// Turns the portfolio plan into entry orders, given current positions
/// and a window of OHLCV prices. Output must satisfy the Order contract.
pub trait EntryOrderCreator: Send + Sync {
    fn create(
        &self,
        portfolio_plan: &DataFrame,
        current_positions: &DataFrame,
        ohlcv: &DataFrame,
    ) -> LockstepResult<DataFrame>;
}

/// Produces exit orders for current positions. Output must satisfy the
/// Order contract.
pub trait ExitOrderCreator: Send + Sync {
    fn create(
        &self,
        current_positions: &DataFrame,
        ohlcv: &DataFrame,
    ) -> LockstepResult<DataFrame>;
}
