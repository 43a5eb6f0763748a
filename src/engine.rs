use std::{collections::HashMap, str::FromStr, sync::Arc};

use chrono::NaiveDateTime;
use polars::frame::DataFrame;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    config::Config,
    context::Context,
    error::{ConfigError, EngineError, LockstepError, LockstepResult},
    exchange::ExchangeClient,
    schema::TableKind,
    source::{DataSource, OHLCV_SOURCE_NAME},
    store::{ArtifactKind, ArtifactStore},
    strategy::{EntryOrderCreator, ExitOrderCreator, PortfolioConstructor, SignalCalculator},
    window::FetchWindow,
};

/// The six pipeline steps, each independently invokable.
///
/// In a backtest one process runs them back to back; in production an
/// external scheduler (cron, a function runner) may invoke each as its own
/// process. Both paths execute the same handler code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    CalculateSignals,
    ConstructPortfolio,
    CreateEntryOrders,
    CreateExitOrders,
    SubmitEntryOrders,
    SubmitExitOrders,
}

impl StepName {
    /// The full pipeline in execution order.
    pub fn pipeline() -> [StepName; 6] {
        [
            Self::CalculateSignals,
            Self::ConstructPortfolio,
            Self::CreateEntryOrders,
            Self::CreateExitOrders,
            Self::SubmitEntryOrders,
            Self::SubmitExitOrders,
        ]
    }
}

/// Step-ordered execution engine shared by backtest and live trading.
///
/// Every `run_step` reloads the context from the artifact store — the
/// in-memory context is never the source of truth. That buys exact parity
/// between a single-process backtest and a multi-process live deployment
/// at the cost of a small amount of I/O per step.
///
/// Only prerequisite presence is enforced, not freshness: re-running
/// `calculate_signals` without the downstream steps leaves previously
/// produced downstream artifacts in place, reflecting the older signals.
/// This is deliberate — it is what makes partial reruns possible.
pub struct StrategyEngine {
    config: Config,
    data_sources: HashMap<String, Box<dyn DataSource>>,
    signal_calculator: Box<dyn SignalCalculator>,
    portfolio_constructor: Box<dyn PortfolioConstructor>,
    entry_order_creator: Box<dyn EntryOrderCreator>,
    exit_order_creator: Box<dyn ExitOrderCreator>,
    exchange_client: Arc<dyn ExchangeClient>,
    store: ArtifactStore,
}

impl std::fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StrategyEngine {
    pub fn builder() -> StrategyEngineBuilder {
        StrategyEngineBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one step for `target_datetime` per the dispatch contract:
    /// reload the context from the store, stamp the current datetime,
    /// dispatch to the handler, and persist the produced artifact (if
    /// any). Failures from user components, data sources, and the
    /// exchange client come back wrapped in [`EngineError::Step`]; schema
    /// violations, prerequisite errors, and storage errors surface as
    /// themselves.
    #[tracing::instrument(skip(self), fields(step = %step, target = %target_datetime))]
    pub async fn run_step(
        &self,
        target_datetime: NaiveDateTime,
        step: StepName,
    ) -> LockstepResult<()> {
        let mut context = self
            .store
            .load_context(target_datetime, self.exchange_client.as_ref())
            .await?
            .unwrap_or_else(|| Context::new(target_datetime));
        context.current_datetime = target_datetime;

        match step {
            StepName::CalculateSignals => self.calculate_signals(&mut context).await,
            StepName::ConstructPortfolio => self.construct_portfolio(&mut context).await,
            StepName::CreateEntryOrders => self.create_entry_orders(&mut context).await,
            StepName::CreateExitOrders => self.create_exit_orders(&mut context).await,
            StepName::SubmitEntryOrders => self.submit_entry_orders(&context).await,
            StepName::SubmitExitOrders => self.submit_exit_orders(&context).await,
        }
    }

    /// Runs the given steps in order, halting on the first failure.
    pub async fn run_steps(
        &self,
        target_datetime: NaiveDateTime,
        steps: &[StepName],
    ) -> LockstepResult<()> {
        for step in steps {
            self.run_step(target_datetime, *step).await?;
        }
        Ok(())
    }

    /// String entry point for external schedulers. Unknown names are
    /// rejected synchronously, before any I/O.
    pub async fn run_named_step(
        &self,
        target_datetime: NaiveDateTime,
        step_name: &str,
    ) -> LockstepResult<()> {
        let step = StepName::from_str(step_name)
            .map_err(|_| EngineError::InvalidStepName(step_name.to_string()))?;
        self.run_step(target_datetime, step).await
    }

    // ============================================================================
    // Step Handlers
    // ============================================================================

    async fn calculate_signals(&self, context: &mut Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::CalculateSignals;
        let target = context.current_datetime;

        let data = self
            .fetch_data_sources(target)
            .await
            .map_err(|e| step_error(STEP, target, "failed to fetch configured data sources", e))?;
        let signals = self
            .signal_calculator
            .calculate(&data)
            .map_err(|e| step_error(STEP, target, "signal calculator failed", e))?;
        let signals = TableKind::Signal.validate(signals)?;

        self.store
            .save(ArtifactKind::Signals, target, &signals)
            .await?;
        context.signals = Some(signals);
        Ok(())
    }

    async fn construct_portfolio(&self, context: &mut Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::ConstructPortfolio;
        let target = context.current_datetime;

        let signals = self.require_artifact(context, STEP, ArtifactKind::Signals)?;
        let positions = self.fetch_positions(STEP, target).await?;
        let plan = self
            .portfolio_constructor
            .construct(signals, &positions)
            .map_err(|e| step_error(STEP, target, "portfolio constructor failed", e))?;
        let plan = TableKind::Portfolio.validate(plan)?;

        self.store
            .save(ArtifactKind::PortfolioPlan, target, &plan)
            .await?;
        context.portfolio_plan = Some(plan);
        Ok(())
    }

    async fn create_entry_orders(&self, context: &mut Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::CreateEntryOrders;
        let target = context.current_datetime;

        let plan = self
            .require_artifact(context, STEP, ArtifactKind::PortfolioPlan)?
            .clone();
        let positions = self.fetch_positions(STEP, target).await?;
        let ohlcv = self
            .fetch_ohlcv(target)
            .await
            .map_err(|e| step_error(STEP, target, "failed to fetch OHLCV data", e))?;
        let orders = self
            .entry_order_creator
            .create(&plan, &positions, &ohlcv)
            .map_err(|e| step_error(STEP, target, "entry order creator failed", e))?;
        let orders = TableKind::Order.validate(orders)?;

        self.store
            .save(ArtifactKind::EntryOrders, target, &orders)
            .await?;
        context.entry_orders = Some(orders);
        Ok(())
    }

    async fn create_exit_orders(&self, context: &mut Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::CreateExitOrders;
        let target = context.current_datetime;

        let positions = self.fetch_positions(STEP, target).await?;
        let ohlcv = self
            .fetch_ohlcv(target)
            .await
            .map_err(|e| step_error(STEP, target, "failed to fetch OHLCV data", e))?;
        let orders = self
            .exit_order_creator
            .create(&positions, &ohlcv)
            .map_err(|e| step_error(STEP, target, "exit order creator failed", e))?;
        let orders = TableKind::Order.validate(orders)?;

        self.store
            .save(ArtifactKind::ExitOrders, target, &orders)
            .await?;
        context.exit_orders = Some(orders);
        Ok(())
    }

    async fn submit_entry_orders(&self, context: &Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::SubmitEntryOrders;
        self.submit_orders(context, STEP, ArtifactKind::EntryOrders)
            .await
    }

    async fn submit_exit_orders(&self, context: &Context) -> LockstepResult<()> {
        const STEP: StepName = StepName::SubmitExitOrders;
        self.submit_orders(context, STEP, ArtifactKind::ExitOrders)
            .await
    }

    /// Shared tail of the two submit steps: require the stored orders and
    /// hand non-empty tables to the exchange client. Produces no artifact.
    async fn submit_orders(
        &self,
        context: &Context,
        step: StepName,
        kind: ArtifactKind,
    ) -> LockstepResult<()> {
        let target = context.current_datetime;
        let orders = self.require_artifact(context, step, kind)?;

        if orders.height() > 0 {
            self.exchange_client
                .submit_orders(orders)
                .await
                .map_err(|e| step_error(step, target, "order submission failed", e))?;
        }
        Ok(())
    }

    // ============================================================================
    // Shared Fetch Helpers
    // ============================================================================

    fn require_artifact<'a>(
        &self,
        context: &'a Context,
        step: StepName,
        needed: ArtifactKind,
    ) -> LockstepResult<&'a DataFrame> {
        context.artifact(needed).ok_or_else(|| {
            EngineError::PrerequisiteMissing {
                step,
                target_datetime: context.current_datetime,
                needed,
            }
            .into()
        })
    }

    async fn fetch_positions(
        &self,
        step: StepName,
        target: NaiveDateTime,
    ) -> LockstepResult<DataFrame> {
        let positions = self
            .exchange_client
            .fetch_positions()
            .await
            .map_err(|e| step_error(step, target, "failed to fetch positions", e))?;
        TableKind::Position.validate(positions)
    }

    async fn fetch_data_sources(
        &self,
        target: NaiveDateTime,
    ) -> LockstepResult<HashMap<String, DataFrame>> {
        let universe = &self.config.loop_config.universe;
        let mut frames = HashMap::with_capacity(self.data_sources.len());

        for (name, source) in &self.data_sources {
            let window = FetchWindow::for_source(target, source.config())?;
            let frame = source.fetch(window.start, window.end, universe).await?;
            frames.insert(name.clone(), frame);
        }
        Ok(frames)
    }

    async fn fetch_ohlcv(&self, target: NaiveDateTime) -> LockstepResult<DataFrame> {
        let source = self.data_sources.get(OHLCV_SOURCE_NAME).ok_or_else(|| {
            LockstepError::from(ConfigError::Invalid(
                "no 'ohlcv' data source registered".to_string(),
            ))
        })?;
        let window = FetchWindow::for_source(target, source.config())?;
        source
            .fetch(window.start, window.end, &self.config.loop_config.universe)
            .await
    }
}

/// Wraps a step-internal failure, letting schema violations and engine
/// errors (prerequisites, inner step errors) surface unchanged.
fn step_error(
    step: StepName,
    target_datetime: NaiveDateTime,
    message: &str,
    cause: LockstepError,
) -> LockstepError {
    match cause {
        LockstepError::Schema(_) | LockstepError::Engine(_) => cause,
        other => EngineError::Step {
            step,
            target_datetime,
            message: message.to_string(),
            cause: Box::new(other),
        }
        .into(),
    }
}

// ================================================================================================
// Builder
// ================================================================================================

/// Assembles a [`StrategyEngine`], rejecting incomplete wiring at build
/// time instead of failing mid-run.
#[derive(Default)]
pub struct StrategyEngineBuilder {
    config: Option<Config>,
    data_sources: Option<HashMap<String, Box<dyn DataSource>>>,
    signal_calculator: Option<Box<dyn SignalCalculator>>,
    portfolio_constructor: Option<Box<dyn PortfolioConstructor>>,
    entry_order_creator: Option<Box<dyn EntryOrderCreator>>,
    exit_order_creator: Option<Box<dyn ExitOrderCreator>>,
    exchange_client: Option<Arc<dyn ExchangeClient>>,
    store: Option<ArtifactStore>,
}

impl StrategyEngineBuilder {
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_data_sources(mut self, data_sources: HashMap<String, Box<dyn DataSource>>) -> Self {
        self.data_sources = Some(data_sources);
        self
    }

    pub fn with_signal_calculator(mut self, calculator: Box<dyn SignalCalculator>) -> Self {
        self.signal_calculator = Some(calculator);
        self
    }

    pub fn with_portfolio_constructor(
        mut self,
        constructor: Box<dyn PortfolioConstructor>,
    ) -> Self {
        self.portfolio_constructor = Some(constructor);
        self
    }

    pub fn with_entry_order_creator(mut self, creator: Box<dyn EntryOrderCreator>) -> Self {
        self.entry_order_creator = Some(creator);
        self
    }

    pub fn with_exit_order_creator(mut self, creator: Box<dyn ExitOrderCreator>) -> Self {
        self.exit_order_creator = Some(creator);
        self
    }

    pub fn with_exchange_client(mut self, client: Arc<dyn ExchangeClient>) -> Self {
        self.exchange_client = Some(client);
        self
    }

    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> LockstepResult<StrategyEngine> {
        let config = self.config.ok_or_else(|| missing("config"))?;
        let data_sources = self.data_sources.ok_or_else(|| missing("data_sources"))?;

        if !data_sources.contains_key(OHLCV_SOURCE_NAME) {
            return Err(ConfigError::Invalid(format!(
                "a data source named '{OHLCV_SOURCE_NAME}' is required"
            ))
            .into());
        }

        Ok(StrategyEngine {
            config,
            data_sources,
            signal_calculator: self
                .signal_calculator
                .ok_or_else(|| missing("signal_calculator"))?,
            portfolio_constructor: self
                .portfolio_constructor
                .ok_or_else(|| missing("portfolio_constructor"))?,
            entry_order_creator: self
                .entry_order_creator
                .ok_or_else(|| missing("entry_order_creator"))?,
            exit_order_creator: self
                .exit_order_creator
                .ok_or_else(|| missing("exit_order_creator"))?,
            exchange_client: self
                .exchange_client
                .ok_or_else(|| missing("exchange_client"))?,
            store: self.store.ok_or_else(|| missing("store"))?,
        })
    }
}

fn missing(field: &str) -> LockstepError {
    ConfigError::Invalid(format!("engine builder: {field} is required")).into()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ExchangeError;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    #[test]
    fn step_names_round_trip_through_strings() {
        for step in StepName::pipeline() {
            let name = step.to_string();
            assert_eq!(StepName::from_str(&name).unwrap(), step);
        }
        assert_eq!(
            StepName::CalculateSignals.to_string(),
            "calculate_signals"
        );
        assert!(StepName::from_str("calculate_alpha").is_err());
    }

    #[test]
    fn pipeline_order_is_fixed() {
        let pipeline = StepName::pipeline();
        assert_eq!(pipeline[0], StepName::CalculateSignals);
        assert_eq!(pipeline[5], StepName::SubmitExitOrders);
    }

    #[test]
    fn builder_without_components_fails() {
        let err = StrategyEngine::builder().build().unwrap_err();
        assert!(err.to_string().contains("config"));
    }

    #[test]
    fn step_error_wraps_external_causes() {
        let cause = LockstepError::Exchange(ExchangeError::Positions("timeout".to_string()));
        let wrapped = step_error(
            StepName::ConstructPortfolio,
            ts("2024-01-15T09:00:00"),
            "failed to fetch positions",
            cause,
        );
        assert!(matches!(
            wrapped,
            LockstepError::Engine(EngineError::Step { .. })
        ));
    }

    #[test]
    fn step_error_passes_schema_and_engine_errors_through() {
        let schema_cause: LockstepError = crate::error::SchemaError {
            table: TableKind::Signal,
            reason: crate::error::SchemaViolation::MissingColumn("datetime".to_string()),
        }
        .into();
        let passed = step_error(
            StepName::CalculateSignals,
            ts("2024-01-15T09:00:00"),
            "ignored",
            schema_cause,
        );
        assert!(matches!(passed, LockstepError::Schema(_)));

        let prerequisite: LockstepError = EngineError::PrerequisiteMissing {
            step: StepName::SubmitEntryOrders,
            target_datetime: ts("2024-01-15T09:00:00"),
            needed: ArtifactKind::EntryOrders,
        }
        .into();
        let passed = step_error(
            StepName::SubmitEntryOrders,
            ts("2024-01-15T09:00:00"),
            "ignored",
            prerequisite,
        );
        assert!(matches!(
            passed,
            LockstepError::Engine(EngineError::PrerequisiteMissing { .. })
        ));
    }
}
