// === Public Modules (The Canonical Paths) ===
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod io;
pub mod schema;
pub mod sim;
pub mod source;
pub mod store;
pub mod strategy;
pub mod window;

// === Convenience Re-exports ===
pub use crate::{
    engine::{StepName, StrategyEngine, StrategyEngineBuilder},
    error::{LockstepError, LockstepResult},
    sim::SimulatedExchange,
    store::{ArtifactKind, ArtifactStore},
};
