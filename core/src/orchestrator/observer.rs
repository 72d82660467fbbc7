use fortress_common::audit::{PluginOutcome, RunId};
use fortress_common::lifecycle::{RunState, StageKind, StageStatus};

/// A committed change, published after its audit event was written.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Run {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    Stage {
        run_id: RunId,
        stage: StageKind,
        from: StageStatus,
        to: StageStatus,
    },
    Plugin {
        run_id: RunId,
        stage: StageKind,
        plugin: String,
        outcome: PluginOutcome,
    },
}

/// Receives progress of runs. Called inline from the orchestrator, so
/// implementations must return quickly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}
