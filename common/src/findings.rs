//! Structured results produced by plugins and collected into reports.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::lifecycle::StageKind;
use crate::network::target::Target;

/// A file left behind by a stage (capture, cracked key list, portal log)
/// and offered to the stages after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub producer: String,
    pub stage: StageKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    DeviceInventory {
        targets: Vec<Target>,
    },
    /// Key material or a login recovered for `target`.
    Credential {
        target: String,
        credential_type: String,
        detail: String,
    },
    Artifact(Artifact),
    Note {
        message: String,
    },
}

impl Finding {
    pub fn note(message: impl Into<String>) -> Self {
        Finding::Note {
            message: message.into(),
        }
    }

    pub fn as_artifact(&self) -> Option<&Artifact> {
        match self {
            Finding::Artifact(artifact) => Some(artifact),
            _ => None,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::DeviceInventory { targets } => write!(f, "{} devices inventoried", targets.len()),
            Finding::Credential {
                target,
                credential_type,
                detail,
            } => write!(f, "{credential_type} for {target}: {detail}"),
            Finding::Artifact(a) => write!(f, "{} artifact from {}: {}", a.stage, a.producer, a.path.display()),
            Finding::Note { message } => f.write_str(message),
        }
    }
}
