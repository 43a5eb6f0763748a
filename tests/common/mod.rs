//! Shared fixtures for the integration suites.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::NaiveDateTime;
use polars::{df, frame::DataFrame};

use lockstep::{
    SimulatedExchange, StrategyEngine,
    config::{
        Config, CostConfig, DataSourceConfig, GeneralConfig, LoopConfig, SourceKind,
        StepTimingConfig, StorageType,
    },
    io::{ObjectBackend, StorageBackend},
    schema::col,
    source::{DataSource, MemorySource},
    store::ArtifactStore,
    strategy::{
        EqualWeightEntryOrderCreator, EqualWeightParams, FullExitOrderCreator, FullExitParams,
        MovingAverageCrossCalculator, MovingAverageCrossParams, TopNParams,
        TopNPortfolioConstructor,
    },
};

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
}

/// Rows of (datetime, symbol, open, high, low, close, volume).
pub fn ohlcv_frame(rows: &[(&str, &str, f64, f64, f64, f64, i64)]) -> DataFrame {
    let datetime: Vec<NaiveDateTime> = rows.iter().map(|r| ts(r.0)).collect();
    let symbol: Vec<&str> = rows.iter().map(|r| r.1).collect();
    let open: Vec<f64> = rows.iter().map(|r| r.2).collect();
    let high: Vec<f64> = rows.iter().map(|r| r.3).collect();
    let low: Vec<f64> = rows.iter().map(|r| r.4).collect();
    let close: Vec<f64> = rows.iter().map(|r| r.5).collect();
    let volume: Vec<i64> = rows.iter().map(|r| r.6).collect();

    df!(
        col::DATETIME => datetime,
        col::SYMBOL => symbol,
        col::OPEN => open,
        col::HIGH => high,
        col::LOW => low,
        col::CLOSE => close,
        col::VOLUME => volume,
    )
    .unwrap()
}

/// Ten rising daily AAPL bars starting 2024-01-01.
pub fn rising_aapl_bars() -> DataFrame {
    let rows: Vec<(String, f64, f64, f64, f64)> = (0..10)
        .map(|i| {
            let day = format!("2024-01-{:02}T00:00:00", i + 1);
            let open = 100.0 + i as f64;
            (day, open, open + 2.0, open - 1.0, open + 1.0)
        })
        .collect();

    let tuples: Vec<(&str, &str, f64, f64, f64, f64, i64)> = rows
        .iter()
        .map(|(day, o, h, l, c)| (day.as_str(), "AAPL", *o, *h, *l, *c, 1000i64))
        .collect();
    ohlcv_frame(&tuples)
}

pub fn ohlcv_source_config() -> DataSourceConfig {
    DataSourceConfig {
        name: "ohlcv".to_string(),
        datetime_column: col::DATETIME.to_string(),
        offset_seconds: 0,
        window_seconds: 86400 * 10,
        kind: SourceKind::Memory,
        source_path: String::new(),
    }
}

pub fn test_config() -> Config {
    Config {
        general: GeneralConfig {
            strategy_name: "it-harness".to_string(),
            storage_type: StorageType::Memory,
            workspace: None,
            s3_bucket: None,
            s3_region: None,
        },
        data_sources: vec![ohlcv_source_config()],
        costs: CostConfig::default(),
        loop_config: LoopConfig {
            frequency: Duration::from_secs(86400),
            start_date: ts("2024-01-01T00:00:00"),
            end_date: ts("2024-01-10T00:00:00"),
            universe: vec!["AAPL".to_string()],
            step_timings: StepTimingConfig::default(),
        },
    }
}

pub fn memory_backend() -> Arc<dyn StorageBackend> {
    Arc::new(ObjectBackend::in_memory())
}

pub async fn simulator(frame: DataFrame) -> Arc<SimulatedExchange> {
    let source = MemorySource::new(ohlcv_source_config(), frame);
    let sim = SimulatedExchange::new(CostConfig::default(), Box::new(source));
    sim.load_ohlcv(ts("2024-01-01T00:00:00"), ts("2024-02-01T00:00:00"), &[])
        .await
        .unwrap();
    Arc::new(sim)
}

/// Full engine on the given backend: MA-cross signals, top-N portfolio,
/// equal-weight entries, full exits, simulated exchange.
pub fn build_engine(
    backend: Arc<dyn StorageBackend>,
    bars: DataFrame,
    exchange: Arc<SimulatedExchange>,
) -> StrategyEngine {
    let mut data_sources: HashMap<String, Box<dyn DataSource>> = HashMap::new();
    data_sources.insert(
        "ohlcv".to_string(),
        Box::new(MemorySource::new(ohlcv_source_config(), bars)),
    );

    StrategyEngine::builder()
        .with_config(test_config())
        .with_data_sources(data_sources)
        .with_signal_calculator(Box::new(
            MovingAverageCrossCalculator::new(MovingAverageCrossParams {
                short_window: 2,
                long_window: 3,
            })
            .unwrap(),
        ))
        .with_portfolio_constructor(Box::new(
            TopNPortfolioConstructor::new(TopNParams {
                top_n: 5,
                ascending: false,
            })
            .unwrap(),
        ))
        .with_entry_order_creator(Box::new(
            EqualWeightEntryOrderCreator::new(EqualWeightParams {
                capital: 100_000.0,
                rebalance_threshold: 0.0,
            })
            .unwrap(),
        ))
        .with_exit_order_creator(Box::new(
            FullExitOrderCreator::new(FullExitParams::default()).unwrap(),
        ))
        .with_exchange_client(exchange)
        .with_store(ArtifactStore::with_default_base(backend))
        .build()
        .unwrap()
}
