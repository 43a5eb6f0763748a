use async_trait::async_trait;
use chrono::NaiveDateTime;
use polars::frame::DataFrame;

use crate::error::LockstepResult;

/// The exchange surface the engine talks to — identical for the execution
/// simulator in a backtest and a real brokerage client in production.
///
/// The engine never assumes fills are instantaneous: `submit_orders` does
/// not return fills, and executions are observed later through
/// `fetch_fills`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submits a validated Order table for execution.
    async fn submit_orders(&self, orders: &DataFrame) -> LockstepResult<()>;

    /// Returns Fill rows with `start <= timestamp <= end`. Repeated calls
    /// with the same bounds return the same rows.
    async fn fetch_fills(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> LockstepResult<DataFrame>;

    /// Returns the current Position table. Positions are derived state and
    /// are never persisted by the engine; every read reflects the fills
    /// known to the client at call time.
    async fn fetch_positions(&self) -> LockstepResult<DataFrame>;
}
