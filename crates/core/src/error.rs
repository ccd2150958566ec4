use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ReclaimError> = std::result::Result<T, E>;

/// Every failure the reclamation core can describe.
///
/// Only [`ReclaimError::ScanRootInaccessible`] aborts a run. The other
/// variants are recorded inside the reports they belong to and their
/// `Display` text becomes the `reason` shown to the operator.
#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("scan root {} cannot be listed: {source}", path.display())]
    ScanRootInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walk under {} aborted at {}: {reason}", root.display(), path.display())]
    WalkAborted {
        root: PathBuf,
        path: PathBuf,
        reason: String,
    },

    #[error("volume {volume_id} unavailable: {reason}")]
    VolumeUnavailable { volume_id: String, reason: String },

    #[error("action '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("relocation of {} failed: {reason}", path.display())]
    RelocationFailed { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReclaimError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ScanRootInaccessible { .. })
    }
}
