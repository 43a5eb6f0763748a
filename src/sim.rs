pub mod position;

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use itertools::izip;
use polars::{df, frame::DataFrame};
use uuid::Uuid;

use crate::{
    config::{CostConfig, LimitFillBarType, MarketFillPriceType},
    error::{ExchangeError, LockstepError, LockstepResult, polars_err},
    exchange::ExchangeClient,
    schema::{OrderType, Side, TableKind, col},
    sim::position::{derive_positions, positions_to_frame},
    source::DataSource,
};

/// One realized execution in the simulator's fill log.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    datetime: NaiveDateTime,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

#[derive(Default)]
struct SimState {
    /// Time-sorted bars per symbol.
    bars: BTreeMap<String, Vec<Bar>>,
    current_datetime: Option<NaiveDateTime>,
    /// Append-only; append order equals submission order.
    fills: Vec<Fill>,
}

/// Deterministic order-fill engine sharing the exchange surface with live
/// clients, so backtest and production run the same engine code.
///
/// Market orders fill at the next bar's open or the current bar's close
/// (per [`MarketFillPriceType`]) with slippage applied against the taker;
/// limit orders fill at the limit price when the judging bar's range
/// strictly crosses it — touching the price exactly does not fill, and no
/// slippage applies. Orders with no judging bar are dropped without a
/// fill. Positions are never stored: they are recomputed on demand from
/// the fill log.
///
/// Known limitation: next/current-bar selection is pure timestamp
/// comparison. Trading-calendar awareness (holidays, sessions,
/// after-hours) is not modeled.
pub struct SimulatedExchange {
    costs: CostConfig,
    ohlcv_source: Box<dyn DataSource>,
    state: Mutex<SimState>,
}

impl SimulatedExchange {
    pub fn new(costs: CostConfig, ohlcv_source: Box<dyn DataSource>) -> Self {
        Self {
            costs,
            ohlcv_source,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Pre-loads and caches bars for the whole run. Call once before
    /// iterating; leave headroom past the end date so next-bar fills at
    /// the boundary still find their bar.
    pub async fn load_ohlcv(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        symbols: &[String],
    ) -> LockstepResult<()> {
        let frame = self.ohlcv_source.fetch(start, end, symbols).await?;
        let frame = TableKind::Ohlcv.validate(frame)?;
        let bars = frame_to_bars(&frame)?;

        let mut state = self.lock_state()?;
        state.bars = bars;
        Ok(())
    }

    /// Advances the simulation clock to the current iteration datetime.
    pub fn set_current_datetime(&self, datetime: NaiveDateTime) {
        if let Ok(mut state) = self.state.lock() {
            state.current_datetime = Some(datetime);
        }
    }

    fn lock_state(&self) -> LockstepResult<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| ExchangeError::Submit("simulator state poisoned".to_string()).into())
    }

    fn apply_slippage(&self, price: f64, side: Side) -> f64 {
        let rate = self.costs.slippage_bps / 10_000.0;
        match side {
            Side::Buy => price * (1.0 + rate),
            Side::Sell => price * (1.0 - rate),
        }
    }

    fn commission(&self, price: f64, quantity: f64) -> f64 {
        price * quantity * self.costs.commission_rate
    }

    fn fill_market(
        &self,
        state: &SimState,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Option<Fill> {
        let cursor = state.current_datetime?;
        let bar = match self.costs.market_fill_price_type {
            MarketFillPriceType::NextOpen => next_bar(&state.bars, symbol, cursor)?,
            MarketFillPriceType::CurrentClose => current_bar(&state.bars, symbol, cursor)?,
        };
        let base_price = match self.costs.market_fill_price_type {
            MarketFillPriceType::NextOpen => bar.open,
            MarketFillPriceType::CurrentClose => bar.close,
        };

        let price = self.apply_slippage(base_price, side);
        Some(Fill {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            commission: self.commission(price, quantity),
            timestamp: bar.datetime,
        })
    }

    fn fill_limit(
        &self,
        state: &SimState,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Option<Fill> {
        let cursor = state.current_datetime?;
        let bar = match self.costs.limit_fill_bar_type {
            LimitFillBarType::NextBar => next_bar(&state.bars, symbol, cursor)?,
            LimitFillBarType::CurrentBar => current_bar(&state.bars, symbol, cursor)?,
        };

        // Strict inequality: touching the limit exactly does not fill.
        let crossed = match side {
            Side::Buy => limit_price > bar.low,
            Side::Sell => limit_price < bar.high,
        };
        if !crossed {
            return None;
        }

        // Limit fills carry no slippage.
        Some(Fill {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price: limit_price,
            commission: self.commission(limit_price, quantity),
            timestamp: bar.datetime,
        })
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    async fn submit_orders(&self, orders: &DataFrame) -> LockstepResult<()> {
        let orders = TableKind::Order.validate(orders.clone())?;

        let symbols = orders
            .column(col::SYMBOL)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?;
        let sides = orders
            .column(col::SIDE)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?;
        let quantities = orders
            .column(col::QUANTITY)
            .map_err(polars_err)?
            .f64()
            .map_err(polars_err)?;
        let prices = orders
            .column(col::PRICE)
            .map_err(polars_err)?
            .f64()
            .map_err(polars_err)?;
        let order_types = orders
            .column(col::ORDER_TYPE)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?;

        let mut state = self.lock_state()?;

        for row in 0..orders.height() {
            let (Some(symbol), Some(side), Some(quantity), Some(order_type)) = (
                symbols.get(row),
                sides.get(row),
                quantities.get(row),
                order_types.get(row),
            ) else {
                continue;
            };
            let side = Side::from_str(side)
                .map_err(|_| exchange_err(format!("unknown side '{side}'")))?;
            let order_type = OrderType::from_str(order_type)
                .map_err(|_| exchange_err(format!("unknown order type '{order_type}'")))?;

            let fill = match order_type {
                OrderType::Market => self.fill_market(&state, symbol, side, quantity),
                OrderType::Limit => {
                    let limit_price = prices.get(row).ok_or_else(|| {
                        exchange_err(format!("limit order for '{symbol}' has no price"))
                    })?;
                    self.fill_limit(&state, symbol, side, quantity, limit_price)
                }
            };

            match fill {
                Some(fill) => {
                    tracing::debug!(
                        symbol = %fill.symbol,
                        side = %fill.side,
                        quantity = fill.quantity,
                        price = fill.price,
                        ts = %fill.timestamp,
                        "order filled"
                    );
                    state.fills.push(fill);
                }
                None => {
                    tracing::warn!(symbol, side = %side, quantity, "order not filled");
                }
            }
        }

        Ok(())
    }

    async fn fetch_fills(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> LockstepResult<DataFrame> {
        let state = self.lock_state()?;
        let in_range: Vec<&Fill> = state
            .fills
            .iter()
            .filter(|fill| fill.timestamp >= start && fill.timestamp <= end)
            .collect();

        let frame = fills_to_frame(&in_range)?;
        TableKind::Fill.validate(frame)
    }

    async fn fetch_positions(&self) -> LockstepResult<DataFrame> {
        let state = self.lock_state()?;
        positions_to_frame(&derive_positions(&state.fills))
    }
}

fn exchange_err(message: String) -> LockstepError {
    ExchangeError::Submit(message).into()
}

/// First bar strictly after the cursor.
fn next_bar(bars: &BTreeMap<String, Vec<Bar>>, symbol: &str, cursor: NaiveDateTime) -> Option<Bar> {
    let series = bars.get(symbol)?;
    let index = series.partition_point(|bar| bar.datetime <= cursor);
    series.get(index).copied()
}

/// Latest bar at or before the cursor.
fn current_bar(
    bars: &BTreeMap<String, Vec<Bar>>,
    symbol: &str,
    cursor: NaiveDateTime,
) -> Option<Bar> {
    let series = bars.get(symbol)?;
    let index = series.partition_point(|bar| bar.datetime <= cursor);
    if index == 0 {
        None
    } else {
        series.get(index - 1).copied()
    }
}

fn frame_to_bars(frame: &DataFrame) -> LockstepResult<BTreeMap<String, Vec<Bar>>> {
    let symbols = frame
        .column(col::SYMBOL)
        .map_err(polars_err)?
        .str()
        .map_err(polars_err)?;
    let datetimes = frame
        .column(col::DATETIME)
        .map_err(polars_err)?
        .datetime()
        .map_err(polars_err)?;
    let opens = frame.column(col::OPEN).map_err(polars_err)?.f64().map_err(polars_err)?;
    let highs = frame.column(col::HIGH).map_err(polars_err)?.f64().map_err(polars_err)?;
    let lows = frame.column(col::LOW).map_err(polars_err)?.f64().map_err(polars_err)?;
    let closes = frame.column(col::CLOSE).map_err(polars_err)?.f64().map_err(polars_err)?;

    let mut bars: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
    for (symbol, datetime, open, high, low, close) in izip!(
        symbols,
        datetimes.as_datetime_iter(),
        opens,
        highs,
        lows,
        closes
    ) {
        let (Some(symbol), Some(datetime), Some(open), Some(high), Some(low), Some(close)) =
            (symbol, datetime, open, high, low, close)
        else {
            continue;
        };
        bars.entry(symbol.to_string()).or_default().push(Bar {
            datetime,
            open,
            high,
            low,
            close,
        });
    }

    for series in bars.values_mut() {
        series.sort_by_key(|bar| bar.datetime);
    }
    Ok(bars)
}

fn fills_to_frame(fills: &[&Fill]) -> LockstepResult<DataFrame> {
    if fills.is_empty() {
        return Ok(TableKind::Fill.empty_frame());
    }

    let order_id: Vec<&str> = fills.iter().map(|f| f.order_id.as_str()).collect();
    let symbol: Vec<&str> = fills.iter().map(|f| f.symbol.as_str()).collect();
    let side: Vec<&str> = fills.iter().map(|f| f.side.into()).collect();
    let filled_quantity: Vec<f64> = fills.iter().map(|f| f.quantity).collect();
    let filled_price: Vec<f64> = fills.iter().map(|f| f.price).collect();
    let commission: Vec<f64> = fills.iter().map(|f| f.commission).collect();
    let timestamp: Vec<NaiveDateTime> = fills.iter().map(|f| f.timestamp).collect();

    df!(
        col::ORDER_ID => order_id,
        col::SYMBOL => symbol,
        col::SIDE => side,
        col::FILLED_QUANTITY => filled_quantity,
        col::FILLED_PRICE => filled_price,
        col::COMMISSION => commission,
        col::TIMESTAMP => timestamp,
    )
    .map_err(polars_err)
}

#[cfg(test)]
mod test {
    use crate::{
        config::{DataSourceConfig, SourceKind},
        schema::{OrderRow, orders_to_frame},
        source::MemorySource,
    };

    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn ohlcv_config() -> DataSourceConfig {
        DataSourceConfig {
            name: "ohlcv".to_string(),
            datetime_column: col::DATETIME.to_string(),
            offset_seconds: 0,
            window_seconds: 86400 * 30,
            kind: SourceKind::Memory,
            source_path: String::new(),
        }
    }

    /// AAPL bars: 2024-01-01 (o=100 h=110 l=95 c=105) and
    /// 2024-01-02 (o=105 h=115 l=101 c=110).
    fn two_day_frame() -> DataFrame {
        df!(
            col::DATETIME => [ts("2024-01-01T00:00:00"), ts("2024-01-02T00:00:00")],
            col::SYMBOL => ["AAPL", "AAPL"],
            col::OPEN => [100.0, 105.0],
            col::HIGH => [110.0, 115.0],
            col::LOW => [95.0, 101.0],
            col::CLOSE => [105.0, 110.0],
            col::VOLUME => [1000i64, 1200],
        )
        .unwrap()
    }

    async fn simulator(costs: CostConfig) -> SimulatedExchange {
        let source = MemorySource::new(ohlcv_config(), two_day_frame());
        let sim = SimulatedExchange::new(costs, Box::new(source));
        sim.load_ohlcv(
            ts("2024-01-01T00:00:00"),
            ts("2024-01-10T00:00:00"),
            &[],
        )
        .await
        .unwrap();
        sim
    }

    fn costs(commission_rate: f64, slippage_bps: f64) -> CostConfig {
        CostConfig {
            commission_rate,
            slippage_bps,
            market_fill_price_type: MarketFillPriceType::NextOpen,
            limit_fill_bar_type: LimitFillBarType::NextBar,
        }
    }

    async fn all_fills(sim: &SimulatedExchange) -> DataFrame {
        sim.fetch_fills(ts("2000-01-01T00:00:00"), ts("2100-01-01T00:00:00"))
            .await
            .unwrap()
    }

    // ============================================================================
    // Market Orders
    // ============================================================================

    #[tokio::test]
    async fn market_buy_fills_at_next_open_with_slippage() {
        let sim = simulator(costs(0.001, 10.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Buy, 10.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let fills = all_fills(&sim).await;
        assert_eq!(fills.height(), 1);

        let price = fills.column(col::FILLED_PRICE).unwrap().f64().unwrap().get(0).unwrap();
        let commission = fills.column(col::COMMISSION).unwrap().f64().unwrap().get(0).unwrap();
        let stamp = fills
            .column(col::TIMESTAMP)
            .unwrap()
            .datetime()
            .unwrap()
            .as_datetime_iter()
            .next()
            .flatten()
            .unwrap();

        // next bar open 105, slippage 10 bps against the buyer
        assert!((price - 105.105).abs() < 1e-9);
        assert!((commission - 105.105 * 10.0 * 0.001).abs() < 1e-9);
        assert_eq!(stamp, ts("2024-01-02T00:00:00"));
    }

    #[tokio::test]
    async fn market_sell_slips_downward() {
        let sim = simulator(costs(0.0, 10.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Sell, 10.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let fills = all_fills(&sim).await;
        let price = fills.column(col::FILLED_PRICE).unwrap().f64().unwrap().get(0).unwrap();
        assert!((price - 105.0 * 0.999).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_order_without_next_bar_does_not_fill() {
        let sim = simulator(costs(0.001, 10.0)).await;
        sim.set_current_datetime(ts("2024-01-02T00:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Buy, 10.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        assert_eq!(all_fills(&sim).await.height(), 0);
    }

    #[tokio::test]
    async fn market_current_close_uses_latest_bar_at_or_before_cursor() {
        let sim = simulator(CostConfig {
            market_fill_price_type: MarketFillPriceType::CurrentClose,
            ..costs(0.0, 0.0)
        })
        .await;
        sim.set_current_datetime(ts("2024-01-01T12:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Buy, 5.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let fills = all_fills(&sim).await;
        let price = fills.column(col::FILLED_PRICE).unwrap().f64().unwrap().get(0).unwrap();
        assert_eq!(price, 105.0);
    }

    #[tokio::test]
    async fn unknown_symbol_does_not_fill() {
        let sim = simulator(costs(0.0, 0.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("TSLA", Side::Buy, 1.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        assert_eq!(all_fills(&sim).await.height(), 0);
    }

    // ============================================================================
    // Limit Orders
    // ============================================================================

    #[tokio::test]
    async fn limit_sell_at_high_does_not_fill() {
        // next bar high = 115; equality does not fill
        let sim = simulator(costs(0.001, 10.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::limit("AAPL", Side::Sell, 10.0, 115.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        assert_eq!(all_fills(&sim).await.height(), 0);
    }

    #[tokio::test]
    async fn limit_sell_below_high_fills_at_limit_without_slippage() {
        let sim = simulator(costs(0.001, 10.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::limit("AAPL", Side::Sell, 10.0, 114.99)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let fills = all_fills(&sim).await;
        assert_eq!(fills.height(), 1);

        let price = fills.column(col::FILLED_PRICE).unwrap().f64().unwrap().get(0).unwrap();
        let stamp = fills
            .column(col::TIMESTAMP)
            .unwrap()
            .datetime()
            .unwrap()
            .as_datetime_iter()
            .next()
            .flatten()
            .unwrap();
        assert_eq!(price, 114.99);
        assert_eq!(stamp, ts("2024-01-02T00:00:00"));
    }

    #[tokio::test]
    async fn limit_buy_requires_price_above_low() {
        let sim = simulator(costs(0.0, 0.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        // next bar low = 101: limit at 101 does not fill, 101.01 does
        let at_low = orders_to_frame(&[OrderRow::limit("AAPL", Side::Buy, 1.0, 101.0)]).unwrap();
        sim.submit_orders(&at_low).await.unwrap();
        assert_eq!(all_fills(&sim).await.height(), 0);

        let above_low =
            orders_to_frame(&[OrderRow::limit("AAPL", Side::Buy, 1.0, 101.01)]).unwrap();
        sim.submit_orders(&above_low).await.unwrap();
        assert_eq!(all_fills(&sim).await.height(), 1);
    }

    #[tokio::test]
    async fn limit_current_bar_mode_judges_current_bar() {
        let sim = simulator(CostConfig {
            limit_fill_bar_type: LimitFillBarType::CurrentBar,
            ..costs(0.0, 0.0)
        })
        .await;
        sim.set_current_datetime(ts("2024-01-01T12:00:00"));

        // current bar (2024-01-01) high = 110
        let orders = orders_to_frame(&[OrderRow::limit("AAPL", Side::Sell, 1.0, 109.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let fills = all_fills(&sim).await;
        assert_eq!(fills.height(), 1);
        let stamp = fills
            .column(col::TIMESTAMP)
            .unwrap()
            .datetime()
            .unwrap()
            .as_datetime_iter()
            .next()
            .flatten()
            .unwrap();
        assert_eq!(stamp, ts("2024-01-01T00:00:00"));
    }

    // ============================================================================
    // Fill Log and Positions
    // ============================================================================

    #[tokio::test]
    async fn fetch_fills_filters_inclusively_and_repeats() {
        let sim = simulator(costs(0.0, 0.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Buy, 10.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        // fill timestamp is 2024-01-02 00:00:00
        let inside = sim
            .fetch_fills(ts("2024-01-02T00:00:00"), ts("2024-01-02T00:00:00"))
            .await
            .unwrap();
        assert_eq!(inside.height(), 1);

        let outside = sim
            .fetch_fills(ts("2024-01-02T00:00:01"), ts("2024-01-03T00:00:00"))
            .await
            .unwrap();
        assert_eq!(outside.height(), 0);

        let again = sim
            .fetch_fills(ts("2024-01-02T00:00:00"), ts("2024-01-02T00:00:00"))
            .await
            .unwrap();
        assert!(again.equals(&inside));
    }

    #[tokio::test]
    async fn positions_follow_fill_replay() {
        let sim = simulator(costs(0.0, 0.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let orders = orders_to_frame(&[
            OrderRow::market("AAPL", Side::Buy, 10.0),
            OrderRow::market("AAPL", Side::Sell, 15.0),
        ])
        .unwrap();
        sim.submit_orders(&orders).await.unwrap();

        let positions = sim.fetch_positions().await.unwrap();
        assert_eq!(positions.height(), 1);

        let quantity = positions.column(col::QUANTITY).unwrap().f64().unwrap().get(0).unwrap();
        let avg_price = positions.column(col::AVG_PRICE).unwrap().f64().unwrap().get(0).unwrap();
        assert_eq!(quantity, -5.0);
        // both fills land on the next bar open (105); the flip carries it
        assert_eq!(avg_price, 105.0);
    }

    #[tokio::test]
    async fn no_fills_means_empty_tables() {
        let sim = simulator(costs(0.0, 0.0)).await;

        assert_eq!(all_fills(&sim).await.height(), 0);
        assert_eq!(sim.fetch_positions().await.unwrap().height(), 0);
    }

    #[tokio::test]
    async fn orders_before_clock_set_do_not_fill() {
        let sim = simulator(costs(0.0, 0.0)).await;

        let orders = orders_to_frame(&[OrderRow::market("AAPL", Side::Buy, 10.0)]).unwrap();
        sim.submit_orders(&orders).await.unwrap();

        assert_eq!(all_fills(&sim).await.height(), 0);
    }

    #[tokio::test]
    async fn invalid_orders_are_rejected_before_any_fill() {
        let sim = simulator(costs(0.0, 0.0)).await;
        sim.set_current_datetime(ts("2024-01-01T09:00:00"));

        let invalid = df!(
            col::SYMBOL => ["AAPL"],
            col::SIDE => ["buy"],
            col::QUANTITY => [10.0],
            col::PRICE => [Some(100.0)],
            col::ORDER_TYPE => ["market"],
        )
        .unwrap();

        assert!(sim.submit_orders(&invalid).await.is_err());
        assert_eq!(all_fills(&sim).await.height(), 0);
    }
}
