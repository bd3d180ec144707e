//! error taxonomy shared by every lifecycle step

use std::path::PathBuf;

use crate::snapshots::SnapshotStep;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Download, extraction, build or package-install failure.
    #[error("setup failed during {step}: {reason}")]
    Setup { step: String, reason: String },

    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("service {action} failed for {unit}: {reason}")]
    Service {
        action: String,
        unit: String,
        reason: String,
    },

    #[error("snapshot aborted while {step}: {source}")]
    Snapshot {
        step: SnapshotStep,
        #[source]
        source: Box<NodeError>,
    },

    #[error("CRITICAL: signing state backup {} is gone; do not start the node until it is restored by hand", path.display())]
    SigningStateMissing { path: PathBuf },

    #[error("invalid mirror choice '{0}' (expected 1 or 2)")]
    InvalidMirror(String),

    #[error("invalid port offset '{0}'")]
    InvalidPortOffset(String),

    #[error("port {port} would be used by both {first} and {second}")]
    PortCollision {
        port: u16,
        first: &'static str,
        second: &'static str,
    },

    #[error("{role} port {base} + offset {offset} exceeds 65535")]
    PortOverflow {
        role: &'static str,
        base: u16,
        offset: u16,
    },

    #[error("malformed block height: {0}")]
    Height(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("config file {} does not exist", path.display())]
    ConfigMissing { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    pub fn setup(step: impl Into<String>, reason: impl ToString) -> Self {
        NodeError::Setup {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    pub fn service(action: &str, unit: &str, reason: impl ToString) -> Self {
        NodeError::Service {
            action: action.to_string(),
            unit: unit.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Sync polling errors that are logged and retried instead of aborting.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Height(_) | NodeError::Http(_))
    }
}
