//! Per-page exploration: the phase pipeline and its discovery steps.

mod context;
mod discovery;
mod extraction;
mod phases;

pub use context::{
    DiscoveredLink, ExplorationContext, ExplorationResults, ExplorationState, LinkSource,
    ModalDiscovery, PageElement,
};
pub use phases::{PhaseKind, PhaseOutcome, PhaseResult, Pipeline, PipelineReport};
