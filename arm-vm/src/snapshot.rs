//! Serialization of thread contexts for suspend/resume.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::CpuContext;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version mismatch: found {0}, expected {SNAPSHOT_VERSION}")]
    VersionMismatch(String),

    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Versioned on-disk form of one thread context.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextSnapshot {
    version: String,
    context: CpuContext,
}

impl ContextSnapshot {
    pub fn capture(context: &CpuContext) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            context: context.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and version-check a snapshot, yielding the restored context.
    pub fn from_bytes(bytes: &[u8]) -> Result<CpuContext, SnapshotError> {
        let snap: ContextSnapshot = bincode::deserialize(bytes)?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch(snap.version));
        }
        Ok(snap.context)
    }
}
