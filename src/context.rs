use chrono::NaiveDateTime;
use polars::frame::DataFrame;

use crate::store::ArtifactKind;

/// The artifacts produced within one logical iteration of the pipeline.
///
/// `current_datetime` is stamped at the start of each step invocation and
/// shared by every handler of the iteration. The four artifact slots fill
/// step by step and are persisted individually; `current_positions` is
/// never persisted — it is always fetched fresh from the exchange client
/// when the context is loaded.
///
/// The context is rebuilt from the artifact store on every `run_step`
/// entry. It is deliberately never cached across invocations: the store is
/// the source of truth, which is what lets a live deployment run each step
/// as a separately scheduled process.
#[derive(Debug, Clone)]
pub struct Context {
    pub current_datetime: NaiveDateTime,
    pub signals: Option<DataFrame>,
    pub portfolio_plan: Option<DataFrame>,
    pub entry_orders: Option<DataFrame>,
    pub exit_orders: Option<DataFrame>,
    pub current_positions: Option<DataFrame>,
}

impl Context {
    pub fn new(current_datetime: NaiveDateTime) -> Self {
        Self {
            current_datetime,
            signals: None,
            portfolio_plan: None,
            entry_orders: None,
            exit_orders: None,
            current_positions: None,
        }
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&DataFrame> {
        match kind {
            ArtifactKind::Signals => self.signals.as_ref(),
            ArtifactKind::PortfolioPlan => self.portfolio_plan.as_ref(),
            ArtifactKind::EntryOrders => self.entry_orders.as_ref(),
            ArtifactKind::ExitOrders => self.exit_orders.as_ref(),
        }
    }

    pub fn set_artifact(&mut self, kind: ArtifactKind, table: DataFrame) {
        match kind {
            ArtifactKind::Signals => self.signals = Some(table),
            ArtifactKind::PortfolioPlan => self.portfolio_plan = Some(table),
            ArtifactKind::EntryOrders => self.entry_orders = Some(table),
            ArtifactKind::ExitOrders => self.exit_orders = Some(table),
        }
    }

    /// True when no step artifact is present (positions do not count; they
    /// are derived state, not a step output).
    pub fn is_empty(&self) -> bool {
        self.signals.is_none()
            && self.portfolio_plan.is_none()
            && self.entry_orders.is_none()
            && self.exit_orders.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    #[test]
    fn new_context_is_empty() {
        let context = Context::new(ts("2024-01-15T09:00:00"));
        assert!(context.is_empty());
        assert!(context.artifact(ArtifactKind::Signals).is_none());
    }

    #[test]
    fn set_artifact_round_trips() {
        use crate::schema::TableKind;

        let mut context = Context::new(ts("2024-01-15T09:00:00"));
        context.set_artifact(ArtifactKind::Signals, TableKind::Signal.empty_frame());

        assert!(!context.is_empty());
        assert!(context.artifact(ArtifactKind::Signals).is_some());
        assert!(context.artifact(ArtifactKind::PortfolioPlan).is_none());
    }
}
