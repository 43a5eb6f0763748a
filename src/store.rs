use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, NaiveDateTime};
use polars::frame::DataFrame;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    context::Context,
    engine::StepName,
    error::LockstepResult,
    exchange::ExchangeClient,
    io::{StorageBackend, partition_prefix},
    schema::TableKind,
};

/// The four persisted step outputs, each stored individually per date.
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
pub enum ArtifactKind {
    Signals,
    PortfolioPlan,
    EntryOrders,
    ExitOrders,
}

impl ArtifactKind {
    /// The table contract an artifact of this kind must satisfy.
    pub fn table_kind(&self) -> TableKind {
        match self {
            Self::Signals => TableKind::Signal,
            Self::PortfolioPlan => TableKind::Portfolio,
            Self::EntryOrders | Self::ExitOrders => TableKind::Order,
        }
    }

    /// The step that produces this artifact.
    pub fn producing_step(&self) -> StepName {
        match self {
            Self::Signals => StepName::CalculateSignals,
            Self::PortfolioPlan => StepName::ConstructPortfolio,
            Self::EntryOrders => StepName::CreateEntryOrders,
            Self::ExitOrders => StepName::CreateExitOrders,
        }
    }
}

static SIGNALS_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"signals_(\d{4}-\d{2}-\d{2})\.parquet$").expect("literal regex"));

/// Persists and loads step outputs, keyed by (kind, target date).
///
/// Files live under `<base>/<YYYY>/<MM>/{kind}_{YYYY-MM-DD}.parquet`. The
/// year/month partition bounds directory listings; the per-kind-per-date
/// files give the step-level granularity needed to resume an iteration
/// mid-pipeline from another process. Tables are revalidated on both write
/// and read, so a stored artifact is always sound to read back.
pub struct ArtifactStore {
    backend: Arc<dyn StorageBackend>,
    base: String,
}

impl ArtifactStore {
    pub const DEFAULT_BASE: &'static str = "outputs/context";

    pub fn new(backend: Arc<dyn StorageBackend>, base: impl Into<String>) -> Self {
        Self {
            backend,
            base: base.into(),
        }
    }

    /// Store rooted at the conventional `outputs/context` prefix.
    pub fn with_default_base(backend: Arc<dyn StorageBackend>) -> Self {
        Self::new(backend, Self::DEFAULT_BASE)
    }

    fn artifact_path(&self, kind: ArtifactKind, target: NaiveDateTime) -> String {
        format!(
            "{}/{kind}_{}.parquet",
            partition_prefix(&self.base, target),
            target.format("%Y-%m-%d")
        )
    }

    /// Persists one artifact, overwriting any previous file for the same
    /// (kind, date) atomically from a reader's perspective.
    pub async fn save(
        &self,
        kind: ArtifactKind,
        target: NaiveDateTime,
        table: &DataFrame,
    ) -> LockstepResult<()> {
        let validated = kind.table_kind().validate(table.clone())?;
        let path = self.artifact_path(kind, target);
        self.backend.save_table(&path, &validated).await?;
        tracing::debug!(%kind, path = %path, rows = validated.height(), "artifact saved");
        Ok(())
    }

    /// Loads one artifact, or `None` when nothing was stored for the
    /// (kind, date). Corruption surfaces as a fatal storage error.
    pub async fn load(
        &self,
        kind: ArtifactKind,
        target: NaiveDateTime,
    ) -> LockstepResult<Option<DataFrame>> {
        let path = self.artifact_path(kind, target);
        match self.backend.load_table(&path).await? {
            Some(table) => {
                let validated = kind.table_kind().validate(table)?;
                tracing::debug!(%kind, path = %path, rows = validated.height(), "artifact loaded");
                Ok(Some(validated))
            }
            None => Ok(None),
        }
    }

    /// True iff any of the four artifact kinds exists for the date.
    pub async fn exists(&self, target: NaiveDateTime) -> LockstepResult<bool> {
        for kind in ArtifactKind::iter() {
            if self
                .backend
                .exists(&self.artifact_path(kind, target))
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The most recent date with a persisted signals artifact, derived by
    /// enumerating `signals_*` files and parsing the date from each name.
    pub async fn latest(&self) -> LockstepResult<Option<NaiveDateTime>> {
        let files = self
            .backend
            .list(&self.base, Some("signals_*.parquet"))
            .await?;

        Ok(files
            .iter()
            .filter_map(|path| {
                let captures = SIGNALS_FILE.captures(path)?;
                let date = NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d").ok()?;
                date.and_hms_opt(0, 0, 0)
            })
            .max())
    }

    /// Reloads the context for `target`: the four persisted artifacts plus
    /// fresh positions from the exchange client. Returns `None` when no
    /// artifact exists for the date.
    pub async fn load_context(
        &self,
        target: NaiveDateTime,
        exchange: &dyn ExchangeClient,
    ) -> LockstepResult<Option<Context>> {
        let signals = self.load(ArtifactKind::Signals, target).await?;
        let portfolio_plan = self.load(ArtifactKind::PortfolioPlan, target).await?;
        let entry_orders = self.load(ArtifactKind::EntryOrders, target).await?;
        let exit_orders = self.load(ArtifactKind::ExitOrders, target).await?;

        if signals.is_none()
            && portfolio_plan.is_none()
            && entry_orders.is_none()
            && exit_orders.is_none()
        {
            return Ok(None);
        }

        let positions = exchange.fetch_positions().await?;
        let positions = TableKind::Position.validate(positions)?;

        Ok(Some(Context {
            current_datetime: target,
            signals,
            portfolio_plan,
            entry_orders,
            exit_orders,
            current_positions: Some(positions),
        }))
    }

    /// Reloads the context for the most recent persisted date.
    pub async fn load_latest_context(
        &self,
        exchange: &dyn ExchangeClient,
    ) -> LockstepResult<Option<Context>> {
        match self.latest().await? {
            Some(target) => self.load_context(target, exchange).await,
            None => Ok(None),
        }
    }
}
