//! State machines of the assessment: runs, stages and plugins.
//!
//! Each enum knows which transitions are legal. Callers re-applying the
//! transition that already happened get [`Transition::Unchanged`] back, which
//! lets supervisors retry without producing duplicate audit records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One phase of the attack chain, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Scan,
    Capture,
    Crack,
    Mitm,
    Report,
}

impl StageKind {
    /// The full chain, Scan through Report.
    pub const CHAIN: [StageKind; 5] = [
        StageKind::Scan,
        StageKind::Capture,
        StageKind::Crack,
        StageKind::Mitm,
        StageKind::Report,
    ];

    /// Attack stages whose failure skips the rest of the chain (except Report).
    pub fn is_attack(self) -> bool {
        matches!(self, StageKind::Capture | StageKind::Crack | StageKind::Mitm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Scan => "Scan",
            StageKind::Capture => "Capture",
            StageKind::Crack => "Crack",
            StageKind::Mitm => "Mitm",
            StageKind::Report => "Report",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scan" => Ok(StageKind::Scan),
            "capture" => Ok(StageKind::Capture),
            "crack" => Ok(StageKind::Crack),
            "mitm" => Ok(StageKind::Mitm),
            "report" => Ok(StageKind::Report),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The state moved; carries the previous state.
    Moved { from: S },
    /// The target state was already current.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn can_move_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Succeeded) | (Running, Failed) | (Running, Skipped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Planned,
    Active,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }

    pub fn can_move_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Planned, Active) | (Planned, Aborted) | (Active, Completed) | (Active, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loaded,
    Initialized,
    Running,
    Cleaned,
    Failed,
}

impl PluginState {
    pub fn can_move_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Loaded)
                | (Loaded, Initialized)
                | (Loaded, Failed)
                | (Cleaned, Failed)
                | (Cleaned, Initialized)
                | (Initialized, Running)
                | (Initialized, Cleaned)
                | (Initialized, Failed)
                | (Running, Cleaned)
                | (Running, Failed)
                | (Cleaned, Loaded)
                | (Failed, Loaded)
        )
    }

    /// Whether the orchestrator may start a new invocation from this state.
    pub fn is_invocable(self) -> bool {
        matches!(self, PluginState::Loaded | PluginState::Cleaned)
    }
}

macro_rules! display_via_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })*
    };
}

display_via_debug!(StageStatus, RunState, PluginState);
